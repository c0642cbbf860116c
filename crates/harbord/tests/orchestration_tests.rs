//! Provisioning Orchestration Tests
//!
//! End-to-end lifecycle tests over the provisioning state machine with
//! in-memory fakes for the cloud provider, DNS provider, remote channel,
//! and the failover controller's status endpoint. No network, no real
//! clusters.
//!
//! Covered here:
//! - happy-path provisioning walks every phase and lands on RUNNING
//! - a mid-batch cloud failure marks the cluster ERROR and keeps the
//!   partial node records for inspection
//! - unreachable nodes exhaust their bounded budget and fail
//! - only one provisioning run can claim a cluster
//! - teardown converges to DELETED even when the provider misbehaves,
//!   and releases the trust pins for recycled addresses
//! - the outbox worker drives a queued task through the same path

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use harbor_common::config::HarborConfig;
use harbor_common::model::{
    Cluster, ClusterStatus, NodeSize, NodeStatus, PostgresVersion, Role,
};
use harbor_common::HarborError;
use harbord::backup::restore::RestoreEngine;
use harbord::backup::ChainEngine;
use harbord::cloud::{CloudProvider, ProviderServer, ServerSpec};
use harbord::dns::{DnsProvider, DnsRecord};
use harbord::leader::{LeaderDiscovery, StatusProbe};
use harbord::outbox::WorkerPool;
use harbord::provision::Orchestrator;
use harbord::remote::{CommandOutput, RemoteExecutor, TrustedExecutor};
use harbord::store::{Store, TaskKind};
use harbord::trust::TrustStore;

// ============================================================================
// Fakes
// ============================================================================

/// Cloud provider handing out sequential addresses. Can be told to fail
/// after N creations or to refuse deletions.
struct FakeCloud {
    next: AtomicU64,
    fail_after: Option<u64>,
    fail_deletes: bool,
    deleted: Mutex<Vec<String>>,
}

impl FakeCloud {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            fail_after: None,
            fail_deletes: false,
            deleted: Mutex::new(Vec::new()),
        }
    }

    fn failing_after(n: u64) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::new()
        }
    }

    fn refusing_deletes() -> Self {
        Self {
            fail_deletes: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_server(&self, spec: &ServerSpec) -> Result<ProviderServer, HarborError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if n > limit {
                return Err(HarborError::Cloud("resource limit exceeded".into()));
            }
        }
        Ok(ProviderServer {
            id: format!("srv-{}", n),
            name: spec.name.clone(),
            public_ip: format!("203.0.113.{}", n),
            private_ip: format!("10.0.1.{}", n),
        })
    }

    async fn delete_server(&self, id: &str) -> Result<(), HarborError> {
        if self.fail_deletes {
            return Err(HarborError::Cloud("api unavailable".into()));
        }
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<String>, HarborError> {
        Ok(vec!["pgharbor-node-v4".into()])
    }

    async fn list_server_types(&self) -> Result<Vec<String>, HarborError> {
        Ok(vec!["cpx21".into(), "cpx31".into(), "cpx41".into()])
    }

    async fn list_locations(&self) -> Result<Vec<String>, HarborError> {
        Ok(vec!["fsn1".into()])
    }
}

struct FakeDns {
    records: Mutex<HashMap<String, String>>,
}

impl FakeDns {
    fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DnsProvider for FakeDns {
    async fn find_record(&self, name: &str) -> Result<Option<DnsRecord>, HarborError> {
        Ok(self.records.lock().unwrap().get(name).map(|v| DnsRecord {
            id: name.to_string(),
            name: name.to_string(),
            value: v.clone(),
            ttl: 60,
        }))
    }

    async fn create_record(&self, name: &str, value: &str, _ttl: u32) -> Result<(), HarborError> {
        self.records
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn update_record(&self, record: &DnsRecord, value: &str) -> Result<(), HarborError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.name.clone(), value.to_string());
        Ok(())
    }

    async fn delete_record(&self, name: &str) -> Result<(), HarborError> {
        self.records.lock().unwrap().remove(name);
        Ok(())
    }
}

const HEALTH_ALL_GOOD: &str = r#"[
    {"endpoint": "10.0.1.1:2379", "health": true},
    {"endpoint": "10.0.1.2:2379", "health": true},
    {"endpoint": "10.0.1.3:2379", "health": true}
]"#;

/// Remote channel fake: per-host keys, scripted stdout by command
/// substring, recorded commands and uploads.
struct FakeChannel {
    outputs: Mutex<Vec<(&'static str, String)>>,
    unreachable: bool,
    executed: Mutex<Vec<(String, String)>>,
    uploads: Mutex<Vec<(String, String, String)>>,
}

impl FakeChannel {
    fn new() -> Self {
        let channel = Self {
            outputs: Mutex::new(Vec::new()),
            unreachable: false,
            executed: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        };
        channel
            .outputs
            .lock()
            .unwrap()
            .push(("etcdctl endpoint health", HEALTH_ALL_GOOD.to_string()));
        channel
    }

    fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new()
        }
    }

    fn commands(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeChannel {
    async fn handshake(&self, host: &str) -> Result<Vec<u8>, HarborError> {
        Ok(format!("ssh-ed25519 key-for-{}", host).into_bytes())
    }

    async fn execute(
        &self,
        host: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, HarborError> {
        self.executed
            .lock()
            .unwrap()
            .push((host.to_string(), command.to_string()));
        if self.unreachable {
            return Ok(CommandOutput {
                exit_code: 255,
                stdout: String::new(),
                stderr: "connection refused".into(),
            });
        }
        let outputs = self.outputs.lock().unwrap();
        let stdout = outputs
            .iter()
            .find(|(needle, _)| command.contains(needle))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn upload(
        &self,
        host: &str,
        path: &str,
        content: &str,
        _mode: &str,
    ) -> Result<(), HarborError> {
        self.uploads
            .lock()
            .unwrap()
            .push((host.to_string(), path.to_string(), content.to_string()));
        Ok(())
    }
}

/// The first node answers as leader once services are up.
struct FirstNodeLeads;

#[async_trait]
impl StatusProbe for FirstNodeLeads {
    async fn role(&self, address: &str) -> Result<Role, HarborError> {
        Ok(if address == "203.0.113.1" {
            Role::Leader
        } else {
            Role::Replica
        })
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    store: Arc<Store>,
    trust: Arc<TrustStore>,
    cloud: Arc<FakeCloud>,
    dns: Arc<FakeDns>,
    channel: Arc<FakeChannel>,
    orchestrator: Arc<Orchestrator>,
}

fn fast_config() -> HarborConfig {
    let mut config = HarborConfig::default();
    config.provision.reachability_attempts = 2;
    config.provision.reachability_interval_secs = 0;
    config.provision.quorum_attempts = 2;
    config.provision.quorum_interval_secs = 0;
    config.provision.leader_attempts = 2;
    config.provision.leader_interval_secs = 0;
    config.backup.restore_ready_interval_secs = 0;
    config.backup.upload_backoff_secs = 0;
    config
}

fn fixture_with(cloud: FakeCloud, channel: FakeChannel) -> Fixture {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let trust = Arc::new(TrustStore::open(Arc::clone(&store)).unwrap());
    let cloud = Arc::new(cloud);
    let dns = Arc::new(FakeDns::new());
    let channel = Arc::new(channel);
    let remote = Arc::new(TrustedExecutor::new(
        Arc::clone(&channel) as Arc<dyn RemoteExecutor>,
        Arc::clone(&trust),
    ));
    let discovery = Arc::new(LeaderDiscovery::new(
        Arc::new(FirstNodeLeads),
        fast_config().leader,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&cloud) as Arc<dyn CloudProvider>,
        Arc::clone(&dns) as Arc<dyn DnsProvider>,
        remote,
        Arc::clone(&trust),
        discovery,
        fast_config(),
    ));
    Fixture {
        store,
        trust,
        cloud,
        dns,
        channel,
        orchestrator,
    }
}

fn fixture() -> Fixture {
    fixture_with(FakeCloud::new(), FakeChannel::new())
}

fn pending_cluster(store: &Store) -> Cluster {
    let cluster = Cluster::new(
        "orders",
        Uuid::new_v4(),
        3,
        NodeSize::Medium,
        "fsn1",
        PostgresVersion::V16,
    );
    store.insert_cluster(&cluster).unwrap();
    cluster
}

// ============================================================================
// Provisioning
// ============================================================================

#[tokio::test]
async fn test_happy_path_reaches_running() {
    let f = fixture();
    let cluster = pending_cluster(&f.store);

    f.orchestrator.provision(cluster.id).await.unwrap();

    let done = f.store.get_cluster(cluster.id).unwrap().unwrap();
    assert_eq!(done.status, ClusterStatus::Running);
    assert_eq!(done.provisioning_progress, 100);
    assert!(done.error_message.is_none());

    let nodes = f.store.list_nodes(cluster.id).unwrap();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Active));
    assert!(nodes.iter().any(|n| n.role_hint == Some(Role::Leader)));

    // DNS points the published hostname at the leader.
    let record = f.dns.records.lock().unwrap().get(&done.slug).cloned();
    assert_eq!(record.as_deref(), Some("203.0.113.1"));
    assert_eq!(
        done.hostname.as_deref(),
        Some(format!("{}.db.pgharbor.io", done.slug).as_str())
    );

    // Every node got pinned on first contact.
    for n in &nodes {
        assert!(f.trust.is_pinned(&n.public_ip).await);
    }
}

#[tokio::test]
async fn test_happy_path_pushes_full_node_configuration() {
    let f = fixture();
    let cluster = pending_cluster(&f.store);
    f.orchestrator.provision(cluster.id).await.unwrap();

    let uploads = f.channel.uploads.lock().unwrap().clone();
    let paths_per_host = |host: &str| -> HashSet<String> {
        uploads
            .iter()
            .filter(|(h, _, _)| h == host)
            .map(|(_, p, _)| p.clone())
            .collect()
    };
    for host in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
        let paths = paths_per_host(host);
        assert!(paths.contains("/etc/pgharbor/cluster.env"), "{}", host);
        assert!(paths.contains("/etc/patroni/patroni.yml"), "{}", host);
        assert!(paths.contains("/etc/pgbackrest/pgbackrest.conf"), "{}", host);
        assert!(paths.contains("/etc/pgbouncer/pgbouncer.ini"), "{}", host);
        assert!(paths.contains("/etc/systemd/system/etcd.service"), "{}", host);
    }

    // Services start only after configuration is in place.
    let commands = f.channel.commands();
    let first_start = commands
        .iter()
        .position(|(_, c)| c.contains("enable --now etcd"))
        .unwrap();
    let last_upload_reload = commands
        .iter()
        .position(|(_, c)| c == "systemctl daemon-reload")
        .unwrap();
    assert!(last_upload_reload < first_start);
}

#[tokio::test]
async fn test_cloud_failure_mid_batch_marks_error() {
    let f = fixture_with(FakeCloud::failing_after(2), FakeChannel::new());
    let cluster = pending_cluster(&f.store);

    assert!(f.orchestrator.provision(cluster.id).await.is_err());

    let failed = f.store.get_cluster(cluster.id).unwrap().unwrap();
    assert_eq!(failed.status, ClusterStatus::Error);
    assert!(failed
        .error_message
        .unwrap()
        .contains("resource limit exceeded"));
    assert!(failed.provisioning_progress < 100);

    // The two servers that were created remain recorded for cleanup.
    assert_eq!(f.store.list_nodes(cluster.id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_unreachable_node_exhausts_budget() {
    let f = fixture_with(FakeCloud::new(), FakeChannel::unreachable());
    let cluster = pending_cluster(&f.store);

    let err = f.orchestrator.provision(cluster.id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HarborError>(),
        Some(HarborError::NodeUnreachable { attempts: 2, .. })
    ));
    assert_eq!(
        f.store.get_cluster(cluster.id).unwrap().unwrap().status,
        ClusterStatus::Error
    );
}

#[tokio::test]
async fn test_provision_claims_cluster_exactly_once() {
    let f = fixture();
    let cluster = pending_cluster(&f.store);

    f.orchestrator.provision(cluster.id).await.unwrap();

    // The cluster left PENDING, so a second run cannot claim it.
    let err = f.orchestrator.provision(cluster.id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HarborError>(),
        Some(HarborError::OperationInFlight(_))
    ));
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_teardown_deletes_everything() {
    let f = fixture();
    let cluster = pending_cluster(&f.store);
    f.orchestrator.provision(cluster.id).await.unwrap();
    let slug = f.store.get_cluster(cluster.id).unwrap().unwrap().slug;

    f.orchestrator.teardown(cluster.id).await.unwrap();

    let gone = f.store.get_cluster(cluster.id).unwrap().unwrap();
    assert_eq!(gone.status, ClusterStatus::Deleted);
    assert_eq!(f.cloud.deleted.lock().unwrap().len(), 3);
    assert!(f.dns.records.lock().unwrap().get(&slug).is_none());
    for ip in ["203.0.113.1", "203.0.113.2", "203.0.113.3"] {
        assert!(!f.trust.is_pinned(ip).await);
    }
}

#[tokio::test]
async fn test_teardown_converges_despite_provider_failures() {
    let f = fixture_with(FakeCloud::refusing_deletes(), FakeChannel::new());
    let cluster = pending_cluster(&f.store);
    f.orchestrator.provision(cluster.id).await.unwrap();

    f.orchestrator.teardown(cluster.id).await.unwrap();

    assert_eq!(
        f.store.get_cluster(cluster.id).unwrap().unwrap().status,
        ClusterStatus::Deleted
    );
    // Pins still released so the recycled addresses can be repinned.
    assert!(!f.trust.is_pinned("203.0.113.1").await);
}

// ============================================================================
// Outbox dispatch
// ============================================================================

#[tokio::test]
async fn test_worker_drives_queued_provisioning_task() {
    let f = fixture();
    let cluster = Cluster::new(
        "orders",
        Uuid::new_v4(),
        3,
        NodeSize::Medium,
        "fsn1",
        PostgresVersion::V16,
    );
    f.store
        .create_cluster_with_task(&cluster, TaskKind::ProvisionCluster)
        .unwrap();

    let remote = Arc::new(TrustedExecutor::new(
        Arc::clone(&f.channel) as Arc<dyn RemoteExecutor>,
        Arc::clone(&f.trust),
    ));
    let discovery = Arc::new(LeaderDiscovery::new(
        Arc::new(FirstNodeLeads),
        fast_config().leader,
    ));
    let backups = Arc::new(ChainEngine::new(
        Arc::clone(&f.store),
        Arc::clone(&remote),
        Arc::clone(&discovery),
        fast_config().backup,
    ));
    let restores = Arc::new(RestoreEngine::new(
        Arc::clone(&f.store),
        remote,
        discovery,
        Arc::clone(&f.orchestrator),
        fast_config().backup,
    ));
    let pool = WorkerPool::new(
        Arc::clone(&f.store),
        Arc::clone(&f.orchestrator),
        backups,
        restores,
        fast_config().worker,
    );

    let task = f.store.claim_next_task().unwrap().unwrap();
    assert_eq!(task.kind, TaskKind::ProvisionCluster);
    assert_eq!(task.entity_id, cluster.id);
    pool.run_task(0, task).await;

    assert_eq!(
        f.store.get_cluster(cluster.id).unwrap().unwrap().status,
        ClusterStatus::Running
    );
    // The queue is drained; nothing is dispatched twice.
    assert!(f.store.claim_next_task().unwrap().is_none());
}
