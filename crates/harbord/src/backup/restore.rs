//! Restore execution.
//!
//! Two shapes: in-place restore of an existing cluster, and restore into
//! a freshly provisioned cluster seeded from the backup. Point-in-time
//! recovery is an in-place concern; the target time must fall inside the
//! backup's recorded recovery window. A new-cluster restore bootstraps
//! from the source stanza's latest set.

use anyhow::Result;
use chrono::{DateTime, Utc};
use harbor_common::config::BackupConfig;
use harbor_common::model::{
    Backup, BackupStatus, Cluster, ClusterStatus, RestoreJob, RestoreStatus, RestoreType,
};
use harbor_common::HarborError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use uuid::Uuid;

use crate::leader::LeaderDiscovery;
use crate::provision::Orchestrator;
use crate::remote::TrustedExecutor;
use crate::store::Store;

pub struct RestoreEngine {
    store: Arc<Store>,
    remote: Arc<TrustedExecutor>,
    discovery: Arc<LeaderDiscovery>,
    orchestrator: Arc<Orchestrator>,
    config: BackupConfig,
}

impl RestoreEngine {
    pub fn new(
        store: Arc<Store>,
        remote: Arc<TrustedExecutor>,
        discovery: Arc<LeaderDiscovery>,
        orchestrator: Arc<Orchestrator>,
        config: BackupConfig,
    ) -> Self {
        Self {
            store,
            remote,
            discovery,
            orchestrator,
            config,
        }
    }

    /// Accept an in-place restore request and enqueue its execution task.
    /// A target time makes this a point-in-time recovery; it must fall
    /// inside the backup's recovery window.
    pub fn request_restore_in_place(
        &self,
        cluster_id: Uuid,
        backup_id: Uuid,
        target_time: Option<DateTime<Utc>>,
    ) -> Result<RestoreJob> {
        let (cluster, backup) = self.validate_source(cluster_id, backup_id)?;
        if cluster.status != ClusterStatus::Running {
            return Err(HarborError::WrongClusterStatus(
                cluster.slug,
                cluster.status.as_str().to_string(),
                ClusterStatus::Running.as_str().to_string(),
            )
            .into());
        }
        if let Some(target) = target_time {
            validate_window(&backup, target)?;
        }

        let restore_type = if target_time.is_some() {
            RestoreType::PointInTime
        } else {
            RestoreType::Full
        };
        let job = RestoreJob::new(cluster_id, backup_id, restore_type, target_time);
        self.store.create_restore_with_task(&job)?;
        info!(
            "In-place restore {} queued for {} from backup {}",
            job.id, cluster.slug, backup_id
        );
        Ok(job)
    }

    /// Accept a restore into a new cluster. The target cluster copies the
    /// source's shape and is provisioned seeded from the backup's stanza.
    pub fn request_restore_to_new(
        &self,
        cluster_id: Uuid,
        backup_id: Uuid,
        new_name: &str,
    ) -> Result<RestoreJob> {
        let (cluster, _backup) = self.validate_source(cluster_id, backup_id)?;

        let target = Cluster::new(
            new_name,
            cluster.owner_id,
            cluster.node_count,
            cluster.node_size,
            &cluster.region,
            cluster.postgres_version,
        );
        self.store.insert_cluster(&target)?;

        let mut job = RestoreJob::new(cluster_id, backup_id, RestoreType::Full, None);
        job.target_cluster_id = Some(target.id);
        self.store.create_restore_with_task(&job)?;
        info!(
            "Restore {} queued: {} -> new cluster {}",
            job.id, cluster.slug, target.slug
        );
        Ok(job)
    }

    fn validate_source(&self, cluster_id: Uuid, backup_id: Uuid) -> Result<(Cluster, Backup)> {
        let cluster = self
            .store
            .get_cluster(cluster_id)?
            .ok_or_else(|| HarborError::Internal(format!("cluster {} not found", cluster_id)))?;
        let backup = self
            .store
            .get_backup(backup_id)?
            .ok_or_else(|| HarborError::Internal(format!("backup {} not found", backup_id)))?;
        if backup.cluster_id != cluster_id {
            return Err(HarborError::Internal(format!(
                "backup {} does not belong to cluster {}",
                backup_id, cluster.slug
            ))
            .into());
        }
        if backup.status != BackupStatus::Completed {
            return Err(HarborError::WrongClusterStatus(
                backup_id.to_string(),
                backup.status.as_str().to_string(),
                BackupStatus::Completed.as_str().to_string(),
            )
            .into());
        }
        if self.store.has_active_restore(cluster_id)? || self.store.has_active_backup(cluster_id)? {
            return Err(HarborError::OperationInFlight(cluster.slug).into());
        }
        Ok((cluster, backup))
    }

    /// Execute a queued restore. Failures mark the job FAILED with the
    /// captured message.
    pub async fn run_restore(&self, job_id: Uuid) -> Result<()> {
        let job = self
            .store
            .get_restore(job_id)?
            .ok_or_else(|| HarborError::Internal(format!("restore {} not found", job_id)))?;

        let result = match job.target_cluster_id {
            Some(target) => self.run_to_new_cluster(&job, target).await,
            None => self.run_in_place(&job).await,
        };

        match result {
            Ok(()) => {
                self.store.set_restore_progress(job_id, "ready", 100)?;
                self.store
                    .update_restore_status(job_id, RestoreStatus::Completed, None)?;
                info!("Restore {} completed", job_id);
                Ok(())
            }
            Err(e) => {
                error!("Restore {} failed: {}", job_id, e);
                if let Err(mark_err) = self.store.update_restore_status(
                    job_id,
                    RestoreStatus::Failed,
                    Some(&e.to_string()),
                ) {
                    error!("Could not record restore failure: {}", mark_err);
                }
                Err(e)
            }
        }
    }

    /// Stop the failover controller cluster-wide, run the tool restore on
    /// the former leader, start everything back up and wait for a leader
    /// to re-emerge.
    async fn run_in_place(&self, job: &RestoreJob) -> Result<()> {
        let cluster = self
            .store
            .get_cluster(job.cluster_id)?
            .ok_or_else(|| HarborError::Internal(format!("cluster {} not found", job.cluster_id)))?;
        let backup = self
            .store
            .get_backup(job.backup_id)?
            .ok_or_else(|| HarborError::Internal(format!("backup {} not found", job.backup_id)))?;
        let nodes = self.store.list_nodes(cluster.id)?;
        if nodes.is_empty() {
            return Err(HarborError::Internal(format!("cluster {} has no nodes", cluster.slug)).into());
        }
        let timeout = Duration::from_secs(self.config.tool_timeout_secs);

        // The controller is about to go down cluster-wide, so the restore
        // host is picked while discovery still works. The advisory
        // fallback is acceptable: any node can serve as restore target.
        let restore_host = self
            .discovery
            .leader_address(&nodes)
            .await
            .map(|a| a.address)
            .unwrap_or_else(|| nodes[0].public_ip.clone());

        self.store
            .set_restore_progress(job.id, "stopping_controller", 10)?;
        for node in &nodes {
            self.remote
                .execute_checked(&node.public_ip, "systemctl stop patroni", timeout)
                .await?;
        }

        self.store.set_restore_progress(job.id, "restoring", 30)?;
        let mut command = format!("pgbackrest --stanza={} --delta", cluster.stanza());
        if let Some(label) = &backup.label {
            command.push_str(&format!(" --set={}", label));
        }
        if let Some(target) = job.target_time {
            command.push_str(&format!(
                " --type=time \"--target={}\" --target-action=promote",
                target.to_rfc3339()
            ));
        }
        command.push_str(" restore");
        self.remote
            .execute_checked(&restore_host, &command, timeout)
            .await?;

        self.store
            .set_restore_progress(job.id, "starting_controller", 70)?;
        for node in &nodes {
            self.remote
                .execute_checked(&node.public_ip, "systemctl start patroni", timeout)
                .await?;
        }

        self.store
            .set_restore_progress(job.id, "waiting_ready", 85)?;
        self.wait_for_leader(&cluster.slug, &nodes).await
    }

    /// Provision the target cluster seeded from the source stanza. The
    /// orchestrator reports its own progress on the target cluster row;
    /// the restore job tracks the overall operation.
    async fn run_to_new_cluster(&self, job: &RestoreJob, target_id: Uuid) -> Result<()> {
        let source = self
            .store
            .get_cluster(job.cluster_id)?
            .ok_or_else(|| HarborError::Internal(format!("cluster {} not found", job.cluster_id)))?;

        self.store.set_restore_progress(job.id, "provisioning", 20)?;
        self.orchestrator
            .provision_from_backup(target_id, &source.stanza())
            .await
    }

    async fn wait_for_leader(
        &self,
        slug: &str,
        nodes: &[harbor_common::model::Node],
    ) -> Result<()> {
        let attempts = self.config.restore_ready_attempts;
        let interval = Duration::from_secs(self.config.restore_ready_interval_secs);
        for attempt in 1..=attempts {
            if self.discovery.find_leader(nodes).await.is_some() {
                info!("Cluster {} ready after restore ({} polls)", slug, attempt);
                return Ok(());
            }
            if attempt < attempts {
                sleep(interval).await;
            }
        }
        Err(HarborError::LeaderElectionTimeout { attempts }.into())
    }
}

/// Reject target times outside the backup's achievable recovery window.
fn validate_window(backup: &Backup, target: DateTime<Utc>) -> Result<(), HarborError> {
    match (backup.recovery_window_start, backup.recovery_window_stop) {
        (Some(start), Some(stop)) if target >= start && target <= stop => Ok(()),
        (start, stop) => Err(HarborError::OutsideRecoveryWindow(
            target.to_rfc3339(),
            start.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
            stop.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudProvider, ProviderServer, ServerSpec};
    use crate::dns::{DnsProvider, DnsRecord};
    use crate::leader::{LeaderDiscovery, StatusProbe};
    use crate::remote::{CommandOutput, RemoteExecutor, TrustedExecutor};
    use crate::trust::TrustStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use harbor_common::config::HarborConfig;
    use harbor_common::model::{
        BackupOrigin, BackupType, Node, NodeSize, NodeStatus, PostgresVersion, Role,
    };
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    struct RecordingExecutor {
        executed: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RemoteExecutor for RecordingExecutor {
        async fn handshake(&self, _host: &str) -> Result<Vec<u8>, HarborError> {
            Ok(b"key".to_vec())
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
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn upload(
            &self,
            _host: &str,
            _path: &str,
            _content: &str,
            _mode: &str,
        ) -> Result<(), HarborError> {
            Ok(())
        }
    }

    struct NullCloud {
        next: AtomicU64,
    }

    #[async_trait]
    impl CloudProvider for NullCloud {
        async fn create_server(&self, spec: &ServerSpec) -> Result<ProviderServer, HarborError> {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderServer {
                id: n.to_string(),
                name: spec.name.clone(),
                public_ip: format!("203.0.113.{}", n),
                private_ip: format!("10.0.1.{}", n),
            })
        }
        async fn delete_server(&self, _id: &str) -> Result<(), HarborError> {
            Ok(())
        }
        async fn list_images(&self) -> Result<Vec<String>, HarborError> {
            Ok(vec![])
        }
        async fn list_server_types(&self) -> Result<Vec<String>, HarborError> {
            Ok(vec![])
        }
        async fn list_locations(&self) -> Result<Vec<String>, HarborError> {
            Ok(vec![])
        }
    }

    struct NullDns;

    #[async_trait]
    impl DnsProvider for NullDns {
        async fn find_record(&self, _name: &str) -> Result<Option<DnsRecord>, HarborError> {
            Ok(None)
        }
        async fn create_record(
            &self,
            _name: &str,
            _value: &str,
            _ttl: u32,
        ) -> Result<(), HarborError> {
            Ok(())
        }
        async fn update_record(
            &self,
            _record: &DnsRecord,
            _value: &str,
        ) -> Result<(), HarborError> {
            Ok(())
        }
        async fn delete_record(&self, _name: &str) -> Result<(), HarborError> {
            Ok(())
        }
    }

    struct AllLeaders;

    #[async_trait]
    impl StatusProbe for AllLeaders {
        async fn role(&self, _address: &str) -> Result<Role, HarborError> {
            Ok(Role::Leader)
        }
    }

    struct Fixture {
        store: Arc<Store>,
        exec: Arc<RecordingExecutor>,
        engine: RestoreEngine,
        cluster: Cluster,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let trust = Arc::new(TrustStore::open(Arc::clone(&store)).unwrap());
        let exec = Arc::new(RecordingExecutor {
            executed: Mutex::new(Vec::new()),
        });
        let remote = Arc::new(TrustedExecutor::new(
            Arc::clone(&exec) as Arc<dyn RemoteExecutor>,
            Arc::clone(&trust),
        ));
        let mut config = HarborConfig::default();
        config.backup.restore_ready_interval_secs = 0;
        config.provision.reachability_interval_secs = 0;
        config.provision.quorum_interval_secs = 0;
        config.provision.leader_interval_secs = 0;

        let discovery = Arc::new(LeaderDiscovery::new(
            Arc::new(AllLeaders),
            config.leader.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::new(NullCloud {
                next: AtomicU64::new(1),
            }),
            Arc::new(NullDns),
            Arc::clone(&remote),
            trust,
            Arc::clone(&discovery),
            config.clone(),
        ));
        let engine = RestoreEngine::new(
            Arc::clone(&store),
            remote,
            discovery,
            orchestrator,
            config.backup.clone(),
        );

        let mut cluster = Cluster::new(
            "orders",
            Uuid::new_v4(),
            1,
            NodeSize::Small,
            "fsn1",
            PostgresVersion::V16,
        );
        cluster.slug = "orders".into();
        cluster.status = ClusterStatus::Running;
        store.insert_cluster(&cluster).unwrap();
        store
            .insert_node(&Node {
                id: Uuid::new_v4(),
                cluster_id: cluster.id,
                name: "orders-1".into(),
                public_ip: "203.0.113.9".into(),
                private_ip: "10.0.1.9".into(),
                status: NodeStatus::Active,
                provider_id: None,
                role_hint: None,
                created_at: Utc::now(),
            })
            .unwrap();

        Fixture {
            store,
            exec,
            engine,
            cluster,
        }
    }

    fn completed_backup(f: &Fixture) -> Backup {
        let mut b = Backup::new(f.cluster.id, BackupOrigin::Manual, Some(BackupType::Full));
        f.store.insert_backup(&b).unwrap();
        b.backup_type = Some(BackupType::Full);
        b.label = Some("20260810-020000F".into());
        b.recovery_window_start = Some(Utc.with_ymd_and_hms(2026, 8, 10, 2, 0, 0).unwrap());
        b.recovery_window_stop = Some(Utc.with_ymd_and_hms(2026, 8, 10, 2, 10, 0).unwrap());
        b.completed_at = Some(Utc::now());
        f.store.record_backup_result(&b).unwrap();
        f.store.get_backup(b.id).unwrap().unwrap()
    }

    #[test]
    fn test_target_time_inside_window_accepted() {
        let f = fixture();
        let backup = completed_backup(&f);
        let inside = backup.recovery_window_start.unwrap() + ChronoDuration::minutes(5);

        let job = f
            .engine
            .request_restore_in_place(f.cluster.id, backup.id, Some(inside))
            .unwrap();
        assert_eq!(job.restore_type, RestoreType::PointInTime);
        assert_eq!(job.target_time, Some(inside));
    }

    #[test]
    fn test_target_time_outside_window_rejected() {
        let f = fixture();
        let backup = completed_backup(&f);
        let outside = backup.recovery_window_stop.unwrap() + ChronoDuration::hours(1);

        let err = f
            .engine
            .request_restore_in_place(f.cluster.id, backup.id, Some(outside))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarborError>(),
            Some(HarborError::OutsideRecoveryWindow(..))
        ));
    }

    #[test]
    fn test_incomplete_backup_rejected() {
        let f = fixture();
        let pending = Backup::new(f.cluster.id, BackupOrigin::Manual, None);
        f.store.insert_backup(&pending).unwrap();

        assert!(f
            .engine
            .request_restore_in_place(f.cluster.id, pending.id, None)
            .is_err());
    }

    #[test]
    fn test_second_restore_rejected_while_active() {
        let f = fixture();
        let backup = completed_backup(&f);
        f.engine
            .request_restore_in_place(f.cluster.id, backup.id, None)
            .unwrap();

        let err = f
            .engine
            .request_restore_in_place(f.cluster.id, backup.id, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarborError>(),
            Some(HarborError::OperationInFlight(_))
        ));
    }

    #[tokio::test]
    async fn test_in_place_restore_sequence() {
        let f = fixture();
        let backup = completed_backup(&f);
        let target = backup.recovery_window_start.unwrap() + ChronoDuration::minutes(3);

        let job = f
            .engine
            .request_restore_in_place(f.cluster.id, backup.id, Some(target))
            .unwrap();
        f.engine.run_restore(job.id).await.unwrap();

        let done = f.store.get_restore(job.id).unwrap().unwrap();
        assert_eq!(done.status, RestoreStatus::Completed);
        assert_eq!(done.progress, 100);

        let commands: Vec<String> = f
            .exec
            .executed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, c)| c.clone())
            .collect();
        let stop = commands
            .iter()
            .position(|c| c == "systemctl stop patroni")
            .unwrap();
        let restore = commands
            .iter()
            .position(|c| c.contains("--set=20260810-020000F") && c.contains("--type=time"))
            .unwrap();
        let start = commands
            .iter()
            .position(|c| c == "systemctl start patroni")
            .unwrap();
        assert!(stop < restore && restore < start);
    }

    #[test]
    fn test_restore_to_new_creates_pending_target() {
        let f = fixture();
        let backup = completed_backup(&f);

        let job = f
            .engine
            .request_restore_to_new(f.cluster.id, backup.id, "orders copy")
            .unwrap();
        let target_id = job.target_cluster_id.unwrap();
        let target = f.store.get_cluster(target_id).unwrap().unwrap();
        assert_eq!(target.status, ClusterStatus::Pending);
        assert_eq!(target.node_count, f.cluster.node_count);
        assert_eq!(target.node_size, f.cluster.node_size);
        assert_ne!(target.slug, f.cluster.slug);
    }
}
