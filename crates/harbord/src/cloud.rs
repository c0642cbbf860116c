//! Cloud VM provider interface.
//!
//! The control plane only needs five operations from the provider; the
//! orchestrator consumes the trait and tests script it in memory.

use async_trait::async_trait;
use harbor_common::config::CloudConfig;
use harbor_common::HarborError;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

/// A created VM as reported by the provider.
#[derive(Debug, Clone)]
pub struct ProviderServer {
    pub id: String,
    pub name: String,
    pub public_ip: String,
    pub private_ip: String,
}

/// What to create.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    pub ssh_key: String,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_server(&self, spec: &ServerSpec) -> Result<ProviderServer, HarborError>;
    async fn delete_server(&self, id: &str) -> Result<(), HarborError>;
    async fn list_images(&self) -> Result<Vec<String>, HarborError>;
    async fn list_server_types(&self) -> Result<Vec<String>, HarborError>;
    async fn list_locations(&self) -> Result<Vec<String>, HarborError>;
}

// Wire shapes for the provider's JSON API.

#[derive(Deserialize)]
struct CreateServerResponse {
    server: ApiServer,
}

#[derive(Deserialize)]
struct ApiServer {
    id: u64,
    name: String,
    public_net: PublicNet,
    #[serde(default)]
    private_net: Vec<PrivateNet>,
}

#[derive(Deserialize)]
struct PublicNet {
    ipv4: Ipv4,
}

#[derive(Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Deserialize)]
struct PrivateNet {
    ip: String,
}

#[derive(Deserialize)]
struct NamedList {
    #[serde(alias = "images", alias = "server_types", alias = "locations")]
    items: Vec<NamedItem>,
}

#[derive(Deserialize)]
struct NamedItem {
    name: String,
}

/// HTTP client for a Hetzner-style cloud API.
pub struct HttpCloudProvider {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl HttpCloudProvider {
    pub fn new(config: &CloudConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_url: config.api_url.clone(),
            token: config.api_token.clone(),
        }
    }

    async fn get_names(&self, path: &str) -> Result<Vec<String>, HarborError> {
        let resp = self
            .client
            .get(format!("{}/{}", self.api_url, path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| HarborError::Cloud(format!("GET {}: {}", path, e)))?;
        if !resp.status().is_success() {
            return Err(HarborError::Cloud(format!(
                "GET {} returned {}",
                path,
                resp.status()
            )));
        }
        let list: NamedList = resp
            .json()
            .await
            .map_err(|e| HarborError::Cloud(format!("parse {}: {}", path, e)))?;
        Ok(list.items.into_iter().map(|i| i.name).collect())
    }
}

#[async_trait]
impl CloudProvider for HttpCloudProvider {
    async fn create_server(&self, spec: &ServerSpec) -> Result<ProviderServer, HarborError> {
        let body = json!({
            "name": spec.name,
            "server_type": spec.server_type,
            "image": spec.image,
            "location": spec.location,
            "ssh_keys": [spec.ssh_key],
        });
        let resp = self
            .client
            .post(format!("{}/servers", self.api_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| HarborError::Cloud(format!("create {}: {}", spec.name, e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(HarborError::Cloud(format!(
                "create {} returned {}: {}",
                spec.name, status, detail
            )));
        }
        let created: CreateServerResponse = resp
            .json()
            .await
            .map_err(|e| HarborError::Cloud(format!("parse create response: {}", e)))?;

        let private_ip = created
            .server
            .private_net
            .first()
            .map(|p| p.ip.clone())
            .unwrap_or_else(|| created.server.public_net.ipv4.ip.clone());

        info!(
            "Created server {} ({}) at {}",
            created.server.name, created.server.id, created.server.public_net.ipv4.ip
        );
        Ok(ProviderServer {
            id: created.server.id.to_string(),
            name: created.server.name,
            public_ip: created.server.public_net.ipv4.ip,
            private_ip,
        })
    }

    async fn delete_server(&self, id: &str) -> Result<(), HarborError> {
        let resp = self
            .client
            .delete(format!("{}/servers/{}", self.api_url, id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| HarborError::Cloud(format!("delete {}: {}", id, e)))?;
        // Already-gone servers are fine; teardown must converge.
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(HarborError::Cloud(format!(
                "delete {} returned {}",
                id,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<String>, HarborError> {
        self.get_names("images").await
    }

    async fn list_server_types(&self) -> Result<Vec<String>, HarborError> {
        self.get_names("server_types").await
    }

    async fn list_locations(&self) -> Result<Vec<String>, HarborError> {
        self.get_names("locations").await
    }
}
