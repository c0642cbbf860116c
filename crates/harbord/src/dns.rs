//! DNS provider interface and the failover synchronizer.
//!
//! Each RUNNING cluster gets an A record `slug.domain` pointed at its
//! current leader. A periodic sweep re-runs leader discovery per cluster
//! and repairs the record on drift. The sweep only executes on whichever
//! control-plane replica is itself currently the database leader, so an
//! HA set of identical replicas does not hammer the DNS API N ways.

use async_trait::async_trait;
use harbor_common::config::DnsConfig;
use harbor_common::model::{Cluster, ClusterStatus};
use harbor_common::HarborError;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::leader::LeaderDiscovery;
use crate::store::Store;

/// One A record at the provider.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    pub value: String,
    pub ttl: u32,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn find_record(&self, name: &str) -> Result<Option<DnsRecord>, HarborError>;
    async fn create_record(&self, name: &str, value: &str, ttl: u32) -> Result<(), HarborError>;
    async fn update_record(&self, record: &DnsRecord, value: &str) -> Result<(), HarborError>;
    async fn delete_record(&self, name: &str) -> Result<(), HarborError>;
}

/// Create or repair the A record for `name` so it resolves to `value`.
/// Returns true if a write was issued.
pub async fn upsert_a_record(
    provider: &dyn DnsProvider,
    name: &str,
    value: &str,
    ttl: u32,
) -> Result<bool, HarborError> {
    match provider.find_record(name).await? {
        None => {
            provider.create_record(name, value, ttl).await?;
            Ok(true)
        }
        Some(record) if record.value != value => {
            provider.update_record(&record, value).await?;
            Ok(true)
        }
        Some(_) => Ok(false),
    }
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RecordsResponse {
    records: Vec<ApiRecord>,
}

#[derive(Deserialize)]
struct ApiRecord {
    id: String,
    name: String,
    value: String,
    ttl: Option<u32>,
    #[serde(rename = "type")]
    record_type: String,
}

/// Client for a Hetzner-DNS-style record API.
pub struct HttpDnsProvider {
    client: reqwest::Client,
    api_url: String,
    token: String,
    zone_id: String,
    ttl: u32,
}

impl HttpDnsProvider {
    pub fn new(config: &DnsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_url: config.api_url.clone(),
            token: config.api_token.clone(),
            zone_id: config.zone_id.clone(),
            ttl: config.record_ttl_secs,
        }
    }
}

#[async_trait]
impl DnsProvider for HttpDnsProvider {
    async fn find_record(&self, name: &str) -> Result<Option<DnsRecord>, HarborError> {
        let resp = self
            .client
            .get(format!("{}/records", self.api_url))
            .query(&[("zone_id", self.zone_id.as_str())])
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(|e| HarborError::Dns(format!("list records: {}", e)))?;
        if !resp.status().is_success() {
            return Err(HarborError::Dns(format!(
                "list records returned {}",
                resp.status()
            )));
        }
        let records: RecordsResponse = resp
            .json()
            .await
            .map_err(|e| HarborError::Dns(format!("parse records: {}", e)))?;
        Ok(records
            .records
            .into_iter()
            .find(|r| r.record_type == "A" && r.name == name)
            .map(|r| DnsRecord {
                id: r.id,
                name: r.name,
                value: r.value,
                ttl: r.ttl.unwrap_or(self.ttl),
            }))
    }

    async fn create_record(&self, name: &str, value: &str, ttl: u32) -> Result<(), HarborError> {
        let body = json!({
            "zone_id": self.zone_id,
            "type": "A",
            "name": name,
            "value": value,
            "ttl": ttl,
        });
        let resp = self
            .client
            .post(format!("{}/records", self.api_url))
            .header("Auth-API-Token", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| HarborError::Dns(format!("create record {}: {}", name, e)))?;
        if !resp.status().is_success() {
            return Err(HarborError::Dns(format!(
                "create record {} returned {}",
                name,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn update_record(&self, record: &DnsRecord, value: &str) -> Result<(), HarborError> {
        let body = json!({
            "zone_id": self.zone_id,
            "type": "A",
            "name": record.name,
            "value": value,
            "ttl": record.ttl,
        });
        let resp = self
            .client
            .put(format!("{}/records/{}", self.api_url, record.id))
            .header("Auth-API-Token", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| HarborError::Dns(format!("update record {}: {}", record.name, e)))?;
        if !resp.status().is_success() {
            return Err(HarborError::Dns(format!(
                "update record {} returned {}",
                record.name,
                resp.status()
            )));
        }
        Ok(())
    }

    async fn delete_record(&self, name: &str) -> Result<(), HarborError> {
        let record = match self.find_record(name).await? {
            Some(r) => r,
            None => return Ok(()),
        };
        let resp = self
            .client
            .delete(format!("{}/records/{}", self.api_url, record.id))
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(|e| HarborError::Dns(format!("delete record {}: {}", name, e)))?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(HarborError::Dns(format!(
                "delete record {} returned {}",
                name,
                resp.status()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Replica guard
// ---------------------------------------------------------------------------

/// Decides whether this control-plane replica runs the periodic sweeps.
#[async_trait]
pub trait ReplicaGuard: Send + Sync {
    async fn is_primary(&self) -> bool;
}

/// Single-instance deployments: always primary.
pub struct AlwaysPrimary;

#[async_trait]
impl ReplicaGuard for AlwaysPrimary {
    async fn is_primary(&self) -> bool {
        true
    }
}

/// HA deployments: probe the local control-plane database's recovery
/// state. Only the replica whose database is not in recovery sweeps.
pub struct RecoveryProbeGuard;

#[async_trait]
impl ReplicaGuard for RecoveryProbeGuard {
    async fn is_primary(&self) -> bool {
        let out = Command::new("psql")
            .args(["-tAc", "select pg_is_in_recovery()"])
            .output()
            .await;
        match out {
            Ok(out) if out.status.success() => {
                String::from_utf8_lossy(&out.stdout).trim() == "f"
            }
            _ => {
                debug!("recovery probe failed; treating this replica as standby");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

pub struct DnsSynchronizer {
    store: Arc<Store>,
    discovery: Arc<LeaderDiscovery>,
    provider: Arc<dyn DnsProvider>,
    guard: Arc<dyn ReplicaGuard>,
    config: DnsConfig,
}

impl DnsSynchronizer {
    pub fn new(
        store: Arc<Store>,
        discovery: Arc<LeaderDiscovery>,
        provider: Arc<dyn DnsProvider>,
        guard: Arc<dyn ReplicaGuard>,
        config: DnsConfig,
    ) -> Self {
        Self {
            store,
            discovery,
            provider,
            guard,
            config,
        }
    }

    /// Periodic entry point; runs until the daemon shuts down.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.sync_interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep().await {
                warn!("DNS sweep failed: {}", e);
            }
        }
    }

    /// One sweep over every RUNNING cluster with a published hostname.
    /// A failure for one cluster is logged and does not stop the rest.
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        if !self.guard.is_primary().await {
            debug!("not the primary control-plane replica; skipping DNS sweep");
            return Ok(0);
        }

        let clusters = self.store.list_clusters_with_status(ClusterStatus::Running)?;
        let mut repaired = 0;
        for cluster in clusters {
            if cluster.hostname.is_none() {
                continue;
            }
            match self.sync_cluster(&cluster).await {
                Ok(true) => {
                    repaired += 1;
                    info!("repaired DNS record for cluster {}", cluster.slug);
                }
                Ok(false) => {}
                Err(e) => warn!("DNS sync failed for cluster {}: {}", cluster.slug, e),
            }
        }
        Ok(repaired)
    }

    /// Compare the record's content to the discovered leader and update
    /// only on mismatch.
    async fn sync_cluster(&self, cluster: &Cluster) -> anyhow::Result<bool> {
        let nodes = self.store.list_nodes(cluster.id)?;
        if nodes.is_empty() {
            return Ok(false);
        }

        let leader = match self.discovery.find_leader(&nodes).await {
            Some(leader) => leader,
            None => {
                // No authoritative leader: leave the record alone rather
                // than point it at a guess.
                debug!("no leader classified for {}; skipping", cluster.slug);
                return Ok(false);
            }
        };

        let updated = upsert_a_record(
            self.provider.as_ref(),
            &cluster.slug,
            &leader.public_ip,
            self.config.record_ttl_secs,
        )
        .await?;
        Ok(updated)
    }
}
