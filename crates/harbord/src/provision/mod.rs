//! Provisioning orchestrator.
//!
//! Drives cluster creation and teardown through a fixed phase sequence,
//! persisting `(step, progress)` after each phase so observers see live
//! progress during the long-running task. Any phase failure marks the
//! cluster ERROR with the captured message; there is no automatic retry
//! and no rollback of already-created resources. Teardown always
//! converges to DELETED, logging per-resource failures.

pub mod templates;

use anyhow::Result;
use harbor_common::config::HarborConfig;
use harbor_common::model::{
    Cluster, ClusterStatus, Node, NodeStatus, Role,
};
use harbor_common::HarborError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cloud::{CloudProvider, ServerSpec};
use crate::dns::{upsert_a_record, DnsProvider};
use crate::leader::LeaderDiscovery;
use crate::remote::TrustedExecutor;
use crate::store::Store;
use crate::trust::TrustStore;

const PHASE_CREATE_NODES: (&str, u8) = ("create_nodes", 10);
const PHASE_WAIT_REACHABLE: (&str, u8) = ("wait_reachable", 25);
const PHASE_PUSH_CONFIG: (&str, u8) = ("push_config", 40);
const PHASE_BOOTSTRAP_CONSENSUS: (&str, u8) = ("bootstrap_consensus", 55);
const PHASE_START_SERVICES: (&str, u8) = ("start_services", 70);
const PHASE_ELECT_LEADER: (&str, u8) = ("elect_leader", 85);
const PHASE_PUBLISH_DNS: (&str, u8) = ("publish_dns", 95);

pub struct Orchestrator {
    store: Arc<Store>,
    cloud: Arc<dyn CloudProvider>,
    dns: Arc<dyn DnsProvider>,
    remote: Arc<TrustedExecutor>,
    trust: Arc<TrustStore>,
    discovery: Arc<LeaderDiscovery>,
    config: HarborConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        cloud: Arc<dyn CloudProvider>,
        dns: Arc<dyn DnsProvider>,
        remote: Arc<TrustedExecutor>,
        trust: Arc<TrustStore>,
        discovery: Arc<LeaderDiscovery>,
        config: HarborConfig,
    ) -> Self {
        Self {
            store,
            cloud,
            dns,
            remote,
            trust,
            discovery,
            config,
        }
    }

    /// Provision a PENDING cluster from a blank bootstrap.
    pub async fn provision(&self, cluster_id: Uuid) -> Result<()> {
        self.provision_inner(cluster_id, None).await
    }

    /// Provision a PENDING cluster that bootstraps by restoring the given
    /// backup stanza instead of a blank initdb.
    pub async fn provision_from_backup(
        &self,
        cluster_id: Uuid,
        source_stanza: &str,
    ) -> Result<()> {
        self.provision_inner(cluster_id, Some(source_stanza)).await
    }

    async fn provision_inner(
        &self,
        cluster_id: Uuid,
        restore_stanza: Option<&str>,
    ) -> Result<()> {
        // Conditional claim: exactly one provisioning run per cluster.
        if !self
            .store
            .try_transition_cluster(cluster_id, ClusterStatus::Pending, ClusterStatus::Creating)?
        {
            return Err(HarborError::OperationInFlight(cluster_id.to_string()).into());
        }

        let cluster = self
            .store
            .get_cluster(cluster_id)?
            .ok_or_else(|| HarborError::Internal(format!("cluster {} vanished", cluster_id)))?;

        info!(
            "Provisioning cluster {} ({} x {} in {})",
            cluster.slug,
            cluster.node_count,
            cluster.node_size.as_str(),
            cluster.region
        );

        match self.run_phases(&cluster, restore_stanza).await {
            Ok(()) => {
                self.store
                    .set_provisioning_progress(cluster_id, "running", 100)?;
                self.store
                    .update_cluster_status(cluster_id, ClusterStatus::Running, None)?;
                info!("Cluster {} is RUNNING", cluster.slug);
                Ok(())
            }
            Err(e) => {
                error!("Provisioning failed for {}: {}", cluster.slug, e);
                // Secondary failures in the failure handler must not mask
                // the original error.
                if let Err(mark_err) = self.store.update_cluster_status(
                    cluster_id,
                    ClusterStatus::Error,
                    Some(&e.to_string()),
                ) {
                    error!(
                        "Could not record failure for {}: {}",
                        cluster.slug, mark_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_phases(&self, cluster: &Cluster, restore_stanza: Option<&str>) -> Result<()> {
        let (step, progress) = PHASE_CREATE_NODES;
        let nodes = self.create_nodes(cluster).await?;
        self.store
            .set_provisioning_progress(cluster.id, step, progress)?;

        let (step, progress) = PHASE_WAIT_REACHABLE;
        self.wait_for_reachability(&nodes).await?;
        self.store
            .set_provisioning_progress(cluster.id, step, progress)?;

        let (step, progress) = PHASE_PUSH_CONFIG;
        self.push_configuration(cluster, &nodes, restore_stanza)
            .await?;
        self.store
            .set_provisioning_progress(cluster.id, step, progress)?;

        let (step, progress) = PHASE_BOOTSTRAP_CONSENSUS;
        self.bootstrap_consensus(cluster, &nodes).await?;
        self.store
            .set_provisioning_progress(cluster.id, step, progress)?;

        let (step, progress) = PHASE_START_SERVICES;
        self.start_services(&nodes).await?;
        self.store
            .set_provisioning_progress(cluster.id, step, progress)?;

        let (step, progress) = PHASE_ELECT_LEADER;
        let leader = self.elect_leader(&nodes).await?;
        self.store
            .set_provisioning_progress(cluster.id, step, progress)?;

        let (step, progress) = PHASE_PUBLISH_DNS;
        self.publish_dns(cluster, &leader).await;
        self.store
            .set_provisioning_progress(cluster.id, step, progress)?;

        Ok(())
    }

    /// Phase 1: allocate N virtual machines from the prebuilt image,
    /// persisting each node record as it is created. A failure mid-batch
    /// aborts the whole operation; partial state is left in place for
    /// manual cleanup rather than silently half-succeeding.
    async fn create_nodes(&self, cluster: &Cluster) -> Result<Vec<Node>> {
        let mut nodes = Vec::with_capacity(cluster.node_count as usize);
        for i in 1..=cluster.node_count {
            let spec = ServerSpec {
                name: format!("{}-{}", cluster.slug, i),
                server_type: cluster.node_size.server_type().to_string(),
                image: self.config.cloud.image.clone(),
                location: cluster.region.clone(),
                ssh_key: self.config.cloud.ssh_key.clone(),
            };
            let server = self.cloud.create_server(&spec).await?;
            let node = Node {
                id: Uuid::new_v4(),
                cluster_id: cluster.id,
                name: server.name.clone(),
                public_ip: server.public_ip.clone(),
                private_ip: server.private_ip.clone(),
                status: NodeStatus::Provisioning,
                provider_id: Some(server.id.clone()),
                role_hint: None,
                created_at: Utc::now(),
            };
            self.store.insert_node(&node)?;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Phase 2: poll each node over the remote channel, sequentially,
    /// with a bounded attempts x interval budget. Exceeding the budget is
    /// fatal. The first successful contact also pins the host key.
    async fn wait_for_reachability(&self, nodes: &[Node]) -> Result<()> {
        let attempts = self.config.provision.reachability_attempts;
        let interval = Duration::from_secs(self.config.provision.reachability_interval_secs);
        let timeout = Duration::from_secs(self.config.provision.remote_timeout_secs);

        for node in nodes {
            let mut reached = false;
            for attempt in 1..=attempts {
                match self.remote.execute(&node.public_ip, "true", timeout).await {
                    Ok(out) if out.success() => {
                        info!("Node {} reachable after {} attempts", node.name, attempt);
                        reached = true;
                        break;
                    }
                    Ok(_) => {}
                    // A pinned-key mismatch can only get worse by retrying.
                    Err(e @ HarborError::HostKeyMismatch { .. }) => return Err(e.into()),
                    Err(_) => {}
                }
                if attempt < attempts {
                    sleep(interval).await;
                }
            }
            if !reached {
                return Err(HarborError::NodeUnreachable {
                    host: node.public_ip.clone(),
                    attempts,
                }
                .into());
            }
            self.store.update_node_status(node.id, NodeStatus::Active)?;
        }
        Ok(())
    }

    /// Phase 3: render and upload per-node configuration: env/secrets
    /// file (restrictive permissions), failover-controller config,
    /// backup tool config, pooler config with its credential file, and
    /// the process-supervisor unit definitions.
    async fn push_configuration(
        &self,
        cluster: &Cluster,
        nodes: &[Node],
        restore_stanza: Option<&str>,
    ) -> Result<()> {
        let timeout = Duration::from_secs(self.config.provision.remote_timeout_secs);
        for node in nodes {
            let host = &node.public_ip;
            self.remote
                .upload(
                    host,
                    "/etc/pgharbor/cluster.env",
                    &templates::env_secrets(cluster),
                    "600",
                )
                .await?;
            self.remote
                .upload(
                    host,
                    "/etc/etcd/etcd.env",
                    &templates::etcd_env(cluster, node, nodes),
                    "644",
                )
                .await?;
            self.remote
                .upload(
                    host,
                    "/etc/patroni/patroni.yml",
                    &templates::patroni_config(cluster, node, nodes, restore_stanza),
                    "600",
                )
                .await?;
            self.remote
                .upload(
                    host,
                    "/etc/pgbackrest/pgbackrest.conf",
                    &templates::pgbackrest_config(cluster),
                    "640",
                )
                .await?;
            self.remote
                .upload(
                    host,
                    "/etc/pgbouncer/pgbouncer.ini",
                    &templates::pgbouncer_config(cluster),
                    "644",
                )
                .await?;
            self.remote
                .upload(
                    host,
                    "/etc/pgbouncer/userlist.txt",
                    &templates::pgbouncer_userlist(cluster),
                    "600",
                )
                .await?;
            for (path, unit) in templates::supervisor_units() {
                self.remote.upload(host, path, unit, "644").await?;
            }
            self.remote
                .execute_checked(host, "systemctl daemon-reload", timeout)
                .await?;
            info!("Configuration pushed to {}", node.name);
        }
        Ok(())
    }

    /// Phase 4: start the consensus store on all nodes, then block on a
    /// cluster-health check until quorum is reported. No single-node
    /// fallback: a cluster that cannot form quorum fails provisioning.
    async fn bootstrap_consensus(&self, cluster: &Cluster, nodes: &[Node]) -> Result<()> {
        let timeout = Duration::from_secs(self.config.provision.remote_timeout_secs);
        for node in nodes {
            self.remote
                .execute_checked(&node.public_ip, "systemctl enable --now etcd", timeout)
                .await?;
        }

        let attempts = self.config.provision.quorum_attempts;
        let interval = Duration::from_secs(self.config.provision.quorum_interval_secs);
        let needed = (cluster.node_count as usize / 2) + 1;
        let probe_host = &nodes[0].public_ip;
        let mut last_seen = 0;

        for attempt in 1..=attempts {
            match self
                .remote
                .execute(
                    probe_host,
                    "etcdctl endpoint health --cluster -w json",
                    timeout,
                )
                .await
            {
                Ok(out) if out.success() => {
                    let healthy = count_healthy_endpoints(&out.stdout);
                    last_seen = healthy;
                    if healthy >= needed {
                        info!(
                            "Consensus quorum formed for {}: {}/{} healthy",
                            cluster.slug, healthy, cluster.node_count
                        );
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(e @ HarborError::HostKeyMismatch { .. }) => return Err(e.into()),
                Err(_) => {}
            }
            if attempt < attempts {
                sleep(interval).await;
            }
        }

        Err(HarborError::QuorumTimeout {
            attempts,
            message: format!("{}/{} endpoints healthy", last_seen, needed),
        }
        .into())
    }

    /// Phase 5: start the failover controller, pooler, and metrics
    /// exporter on all nodes.
    async fn start_services(&self, nodes: &[Node]) -> Result<()> {
        let timeout = Duration::from_secs(self.config.provision.remote_timeout_secs);
        for node in nodes {
            self.remote
                .execute_checked(
                    &node.public_ip,
                    "systemctl enable --now patroni pgbouncer postgres_exporter",
                    timeout,
                )
                .await?;
            info!("Services started on {}", node.name);
        }
        Ok(())
    }

    /// Phase 6: poll every node via leader discovery until one reports
    /// itself leader. First positive wins; exceeding the budget is fatal.
    async fn elect_leader(&self, nodes: &[Node]) -> Result<Node> {
        let attempts = self.config.provision.leader_attempts;
        let interval = Duration::from_secs(self.config.provision.leader_interval_secs);

        for attempt in 1..=attempts {
            if let Some(leader) = self.discovery.find_leader(nodes).await {
                info!(
                    "Leader elected after {} attempts: {}",
                    attempt, leader.name
                );
                self.store.set_node_role_hint(leader.id, Role::Leader)?;
                return Ok(leader);
            }
            if attempt < attempts {
                sleep(interval).await;
            }
        }
        Err(HarborError::LeaderElectionTimeout { attempts }.into())
    }

    /// Phase 7: publish the cluster's DNS record pointing at the elected
    /// leader. DNS failures are logged but non-fatal; the cluster is
    /// reachable by address even without a hostname.
    async fn publish_dns(&self, cluster: &Cluster, leader: &Node) {
        match upsert_a_record(
            self.dns.as_ref(),
            &cluster.slug,
            &leader.public_ip,
            self.config.dns.record_ttl_secs,
        )
        .await
        {
            Ok(_) => {
                let hostname = format!("{}.{}", cluster.slug, self.config.dns.domain);
                if let Err(e) = self.store.set_cluster_hostname(cluster.id, &hostname) {
                    warn!("Could not persist hostname for {}: {}", cluster.slug, e);
                } else {
                    info!("Published {} -> {}", hostname, leader.public_ip);
                }
            }
            Err(e) => {
                warn!(
                    "DNS publish failed for {} (cluster stays reachable by address): {}",
                    cluster.slug, e
                );
            }
        }
    }

    /// Teardown: delete every node at the provider, best-effort remove
    /// the DNS record, release TOFU pins, mark the cluster DELETED.
    /// Per-resource failures are logged and never block convergence.
    pub async fn teardown(&self, cluster_id: Uuid) -> Result<()> {
        let cluster = self
            .store
            .get_cluster(cluster_id)?
            .ok_or_else(|| HarborError::Internal(format!("cluster {} vanished", cluster_id)))?;

        info!("Tearing down cluster {}", cluster.slug);
        self.store
            .update_cluster_status(cluster_id, ClusterStatus::Deleting, None)?;

        for node in self.store.list_nodes(cluster_id)? {
            if let Some(provider_id) = &node.provider_id {
                if let Err(e) = self.cloud.delete_server(provider_id).await {
                    warn!("Could not delete server {} ({}): {}", node.name, provider_id, e);
                }
            }
            if let Err(e) = self.trust.release(&node.public_ip).await {
                warn!("Could not release trust for {}: {}", node.public_ip, e);
            }
            if let Err(e) = self.store.update_node_status(node.id, NodeStatus::Deleted) {
                warn!("Could not mark node {} deleted: {}", node.name, e);
            }
        }

        if let Err(e) = self.dns.delete_record(&cluster.slug).await {
            warn!("Could not delete DNS record for {}: {}", cluster.slug, e);
        }

        self.store
            .update_cluster_status(cluster_id, ClusterStatus::Deleted, None)?;
        info!("Cluster {} deleted", cluster.slug);
        Ok(())
    }
}

/// Count healthy endpoints in the consensus store's health JSON.
fn count_healthy_endpoints(raw: &str) -> usize {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(entries)) => entries
            .iter()
            .filter(|e| e.get("health").and_then(|h| h.as_bool()).unwrap_or(false))
            .count(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_healthy_endpoints() {
        let raw = r#"[
            {"endpoint": "10.0.1.1:2379", "health": true, "took": "1ms"},
            {"endpoint": "10.0.1.2:2379", "health": true, "took": "2ms"},
            {"endpoint": "10.0.1.3:2379", "health": false, "error": "context deadline exceeded"}
        ]"#;
        assert_eq!(count_healthy_endpoints(raw), 2);
        assert_eq!(count_healthy_endpoints("not json"), 0);
        assert_eq!(count_healthy_endpoints("[]"), 0);
    }

    #[test]
    fn test_phase_progress_is_increasing() {
        let phases = [
            PHASE_CREATE_NODES,
            PHASE_WAIT_REACHABLE,
            PHASE_PUSH_CONFIG,
            PHASE_BOOTSTRAP_CONSENSUS,
            PHASE_START_SERVICES,
            PHASE_ELECT_LEADER,
            PHASE_PUBLISH_DNS,
        ];
        for pair in phases.windows(2) {
            assert!(pair[0].1 < pair[1].1, "{} >= {}", pair[0].0, pair[1].0);
        }
    }
}
