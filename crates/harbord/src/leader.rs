//! Leader discovery.
//!
//! Queries the failover controller's local status endpoint on every node of
//! a cluster concurrently and classifies each answer into a typed role.
//! One overall deadline, slightly larger than the per-node timeout, bounds
//! the whole fan-out; whatever partial results arrived by then are used.

use async_trait::async_trait;
use harbor_common::config::LeaderConfig;
use harbor_common::model::{Node, Role};
use harbor_common::HarborError;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Status document served by the failover controller. Only the role label
/// matters here; the controller reports it under `role` with the label
/// vocabulary collapsed by [`Role::from_label`].
#[derive(Debug, Deserialize)]
struct ControllerStatus {
    role: Option<String>,
    #[allow(dead_code)]
    state: Option<String>,
}

/// One node's classified role.
#[derive(Debug, Clone)]
pub struct NodeRole {
    pub node: Node,
    pub role: Role,
}

/// The address leader discovery settled on. `authoritative` is false when
/// no node answered as leader and the designated default was used instead;
/// callers must treat that as advisory.
#[derive(Debug, Clone)]
pub struct LeaderAddress {
    pub address: String,
    pub authoritative: bool,
}

/// Probes one node's failover controller for its role.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn role(&self, address: &str) -> Result<Role, HarborError>;
}

/// HTTP probe against the controller's status port.
pub struct HttpStatusProbe {
    client: reqwest::Client,
    port: u16,
}

impl HttpStatusProbe {
    pub fn new(config: &LeaderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            port: config.controller_port,
        }
    }
}

#[async_trait]
impl StatusProbe for HttpStatusProbe {
    async fn role(&self, address: &str) -> Result<Role, HarborError> {
        let url = format!("http://{}:{}/", address, self.port);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HarborError::Internal(format!("status query {}: {}", url, e)))?;
        let status: ControllerStatus = resp
            .json()
            .await
            .map_err(|e| HarborError::Internal(format!("status parse {}: {}", url, e)))?;
        Ok(status
            .role
            .as_deref()
            .map(Role::from_label)
            .unwrap_or(Role::Unknown))
    }
}

pub struct LeaderDiscovery {
    probe: Arc<dyn StatusProbe>,
    config: LeaderConfig,
}

impl LeaderDiscovery {
    pub fn new(probe: Arc<dyn StatusProbe>, config: LeaderConfig) -> Self {
        Self { probe, config }
    }

    /// Classify every node concurrently (parallelism = node count). Nodes
    /// that fail, time out, or do not answer before the overall deadline
    /// are reported as `Unknown`.
    pub async fn discover(&self, nodes: &[Node]) -> Vec<NodeRole> {
        let per_node = Duration::from_secs(self.config.probe_timeout_secs);
        let overall = Duration::from_secs(self.config.overall_deadline_secs);

        let mut set = JoinSet::new();
        for (idx, node) in nodes.iter().enumerate() {
            let probe = Arc::clone(&self.probe);
            let address = node.public_ip.clone();
            set.spawn(async move {
                let role = match tokio::time::timeout(per_node, probe.role(&address)).await {
                    Ok(Ok(role)) => role,
                    Ok(Err(e)) => {
                        debug!("role query failed for {}: {}", address, e);
                        Role::Unknown
                    }
                    Err(_) => {
                        debug!("role query timed out for {}", address);
                        Role::Unknown
                    }
                };
                (idx, role)
            });
        }

        let mut roles = vec![Role::Unknown; nodes.len()];
        let deadline = tokio::time::sleep(overall);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("leader discovery deadline reached with {} probes outstanding", set.len());
                    break;
                }
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((idx, role))) => roles[idx] = role,
                    Some(Err(e)) => debug!("probe task failed: {}", e),
                },
            }
        }
        set.abort_all();

        nodes
            .iter()
            .cloned()
            .zip(roles)
            .map(|(node, role)| NodeRole { node, role })
            .collect()
    }

    /// First node classified as leader. This is a best-effort race across
    /// the fan-out, not a priority order.
    pub async fn find_leader(&self, nodes: &[Node]) -> Option<Node> {
        self.discover(nodes)
            .await
            .into_iter()
            .find(|nr| nr.role == Role::Leader)
            .map(|nr| nr.node)
    }

    /// Leader address for address-only callers. Falls back to the first
    /// node when no leader was classified; the flag marks that fallback as
    /// advisory, never authoritative.
    pub async fn leader_address(&self, nodes: &[Node]) -> Option<LeaderAddress> {
        if let Some(leader) = self.find_leader(nodes).await {
            return Some(LeaderAddress {
                address: leader.public_ip,
                authoritative: true,
            });
        }
        nodes.first().map(|n| {
            warn!(
                "no leader classified; falling back to default node {}",
                n.public_ip
            );
            LeaderAddress {
                address: n.public_ip.clone(),
                authoritative: false,
            }
        })
    }
}
