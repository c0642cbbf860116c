//! Backup chain engine.
//!
//! Backups form chains: a full backup anchors a chain, and every
//! differential or incremental after it depends on that anchor until the
//! next full. The engine enforces the chain rules on deletion, reconciles
//! what the backup tool actually produced against what was requested, and
//! expires scheduled backups past their retention cycle.
//!
//! All tool invocations run on the cluster leader over the trusted remote
//! channel. The only automatically retried remote path is the repository
//! check after a backup; everything else fails the task on first error.

pub mod restore;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use harbor_common::config::BackupConfig;
use harbor_common::model::{
    Backup, BackupOrigin, BackupStatus, BackupStep, BackupType, ClusterStatus, Node,
};
use harbor_common::HarborError;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::leader::LeaderDiscovery;
use crate::remote::TrustedExecutor;
use crate::store::Store;

// ============================================================================
// TOOL OUTPUT
// ============================================================================

// Wire shapes of `pgbackrest info --output=json`.

#[derive(Deserialize)]
struct StanzaInfo {
    name: String,
    #[serde(default)]
    backup: Vec<ToolBackup>,
}

#[derive(Deserialize)]
struct ToolBackup {
    label: String,
    #[serde(rename = "type")]
    backup_type: String,
    #[serde(default)]
    info: Option<ToolSize>,
    #[serde(default)]
    archive: Option<ToolArchive>,
    timestamp: ToolTimestamp,
}

#[derive(Deserialize)]
struct ToolSize {
    size: Option<u64>,
}

#[derive(Deserialize)]
struct ToolArchive {
    start: Option<String>,
    stop: Option<String>,
}

#[derive(Deserialize)]
struct ToolTimestamp {
    start: i64,
    stop: i64,
}

/// What the tool reports for the most recent backup of a stanza. The
/// actual type may differ from the requested one: the tool promotes to
/// full when no prior chain exists to diff against.
#[derive(Debug, Clone)]
pub struct ReconciledBackup {
    pub label: String,
    pub backup_type: BackupType,
    pub size_bytes: Option<u64>,
    pub wal_start: Option<String>,
    pub wal_stop: Option<String>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_stop: Option<DateTime<Utc>>,
}

fn parse_backup_info(raw: &str, stanza: &str) -> Result<ReconciledBackup, HarborError> {
    let stanzas: Vec<StanzaInfo> = serde_json::from_str(raw)?;
    let entry = stanzas
        .iter()
        .find(|s| s.name == stanza)
        .and_then(|s| s.backup.last())
        .ok_or_else(|| {
            HarborError::Internal(format!("tool reported no backups for stanza {}", stanza))
        })?;

    let backup_type = BackupType::parse(&entry.backup_type).ok_or_else(|| {
        HarborError::Internal(format!("unknown backup type: {}", entry.backup_type))
    })?;

    Ok(ReconciledBackup {
        label: entry.label.clone(),
        backup_type,
        size_bytes: entry.info.as_ref().and_then(|i| i.size),
        wal_start: entry.archive.as_ref().and_then(|a| a.start.clone()),
        wal_stop: entry.archive.as_ref().and_then(|a| a.stop.clone()),
        window_start: DateTime::from_timestamp(entry.timestamp.start, 0),
        window_stop: DateTime::from_timestamp(entry.timestamp.stop, 0),
    })
}

/// Retention deadline for a backup by origin. Manual backups never
/// auto-expire; scheduled ones live for the configured number of cycles.
fn expires_at(
    origin: BackupOrigin,
    created_at: DateTime<Utc>,
    config: &BackupConfig,
) -> Option<DateTime<Utc>> {
    match origin {
        BackupOrigin::Manual => None,
        BackupOrigin::ScheduledDaily => {
            Some(created_at + ChronoDuration::days(config.daily_retention_days as i64))
        }
        BackupOrigin::ScheduledWeekly => {
            Some(created_at + ChronoDuration::weeks(config.weekly_retention_weeks as i64))
        }
        BackupOrigin::ScheduledMonthly => {
            Some(created_at + ChronoDuration::days(30 * config.monthly_retention_months as i64))
        }
    }
}

// ============================================================================
// DELETION IMPACT
// ============================================================================

/// What deleting a backup would take with it.
#[derive(Debug)]
pub struct DeletionImpact {
    pub backup: Backup,
    /// Completed non-full backups chained onto this full, in creation
    /// order. Empty for non-full backups.
    pub dependents: Vec<Backup>,
    /// True when this is the only completed full backup of the cluster.
    pub last_full: bool,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ChainEngine {
    store: Arc<Store>,
    remote: Arc<TrustedExecutor>,
    discovery: Arc<LeaderDiscovery>,
    config: BackupConfig,
}

impl ChainEngine {
    pub fn new(
        store: Arc<Store>,
        remote: Arc<TrustedExecutor>,
        discovery: Arc<LeaderDiscovery>,
        config: BackupConfig,
    ) -> Self {
        Self {
            store,
            remote,
            discovery,
            config,
        }
    }

    /// Accept a backup request and enqueue its execution task. At most one
    /// backup or restore may be active per cluster.
    pub fn request_backup(
        &self,
        cluster_id: Uuid,
        origin: BackupOrigin,
        requested_type: Option<BackupType>,
    ) -> Result<Backup> {
        let cluster = self
            .store
            .get_cluster(cluster_id)?
            .ok_or_else(|| HarborError::Internal(format!("cluster {} not found", cluster_id)))?;
        if cluster.status != ClusterStatus::Running {
            return Err(HarborError::WrongClusterStatus(
                cluster.slug,
                cluster.status.as_str().to_string(),
                ClusterStatus::Running.as_str().to_string(),
            )
            .into());
        }
        if self.store.has_active_backup(cluster_id)? || self.store.has_active_restore(cluster_id)? {
            return Err(HarborError::OperationInFlight(cluster.slug).into());
        }

        let backup = Backup::new(cluster_id, origin, requested_type);
        self.store.create_backup_with_task(&backup)?;
        info!(
            "Backup {} queued for {} ({}, {})",
            backup.id,
            cluster.slug,
            origin.as_str(),
            backup.effective_type().as_tool_arg()
        );
        Ok(backup)
    }

    /// Execute a queued backup end to end, persisting each sub-step at its
    /// boundary. Any failure marks the backup FAILED with the captured
    /// message.
    pub async fn run_backup(&self, backup_id: Uuid) -> Result<()> {
        let backup = self
            .store
            .get_backup(backup_id)?
            .ok_or_else(|| HarborError::Internal(format!("backup {} not found", backup_id)))?;

        match self.run_backup_inner(&backup).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Backup {} failed: {}", backup_id, e);
                if let Err(mark_err) =
                    self.store
                        .update_backup_status(backup_id, BackupStatus::Failed, Some(&e.to_string()))
                {
                    error!("Could not record backup failure: {}", mark_err);
                }
                Err(e)
            }
        }
    }

    async fn run_backup_inner(&self, backup: &Backup) -> Result<()> {
        let cluster = self
            .store
            .get_cluster(backup.cluster_id)?
            .ok_or_else(|| {
                HarborError::Internal(format!("cluster {} not found", backup.cluster_id))
            })?;
        let stanza = cluster.stanza();
        let timeout = Duration::from_secs(self.config.tool_timeout_secs);

        self.store.set_backup_step(backup.id, BackupStep::Preparing)?;
        let leader = self.leader_host(backup.cluster_id).await?;

        self.store
            .set_backup_step(backup.id, BackupStep::Transferring)?;
        let backup_type = backup.effective_type();
        self.remote
            .execute_checked(
                &leader,
                &format!(
                    "pgbackrest --stanza={} --type={} backup",
                    stanza,
                    backup_type.as_tool_arg()
                ),
                timeout,
            )
            .await?;

        self.store
            .set_backup_step(backup.id, BackupStep::Uploading)?;
        self.check_repository(&leader, &stanza, timeout).await?;

        self.store
            .set_backup_step(backup.id, BackupStep::Verifying)?;
        let out = self
            .remote
            .execute_checked(
                &leader,
                &format!("pgbackrest --stanza={} info --output=json", stanza),
                timeout,
            )
            .await?;
        let reconciled = parse_backup_info(&out.stdout, &stanza)?;

        if reconciled.backup_type != backup_type {
            info!(
                "Backup {} promoted from {} to {} by the tool",
                backup.id,
                backup_type.as_tool_arg(),
                reconciled.backup_type.as_tool_arg()
            );
        }

        let mut done = backup.clone();
        done.backup_type = Some(reconciled.backup_type);
        done.label = Some(reconciled.label);
        done.size_bytes = reconciled.size_bytes;
        done.wal_start = reconciled.wal_start;
        done.wal_stop = reconciled.wal_stop;
        done.recovery_window_start = reconciled.window_start;
        done.recovery_window_stop = reconciled.window_stop;
        done.expires_at = expires_at(backup.origin, backup.created_at, &self.config);
        done.completed_at = Some(Utc::now());
        self.store.record_backup_result(&done)?;

        info!(
            "Backup {} completed for {} ({})",
            backup.id,
            cluster.slug,
            done.label.as_deref().unwrap_or("-")
        );
        Ok(())
    }

    /// Verify the repository sees the new backup and its WAL. Object
    /// storage can lag right after a large transfer, so this is the one
    /// remote path with bounded retry.
    async fn check_repository(
        &self,
        leader: &str,
        stanza: &str,
        timeout: Duration,
    ) -> Result<()> {
        let command = format!("pgbackrest --stanza={} check", stanza);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.remote.execute_checked(leader, &command, timeout).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable_remote() && attempt < self.config.upload_retries => {
                    warn!(
                        "Repository check attempt {}/{} failed: {}",
                        attempt, self.config.upload_retries, e
                    );
                    sleep(Duration::from_secs(self.config.upload_backoff_secs)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Compute what deleting the given backup would take with it, without
    /// touching anything.
    pub fn deletion_impact(&self, backup_id: Uuid) -> Result<DeletionImpact> {
        let backup = self
            .store
            .get_backup(backup_id)?
            .ok_or_else(|| HarborError::Internal(format!("backup {} not found", backup_id)))?;
        let all = self.store.list_backups(backup.cluster_id)?;

        let completed_fulls: Vec<&Backup> = all
            .iter()
            .filter(|b| {
                b.status == BackupStatus::Completed && b.backup_type == Some(BackupType::Full)
            })
            .collect();

        if backup.backup_type != Some(BackupType::Full) {
            return Ok(DeletionImpact {
                backup,
                dependents: Vec::new(),
                last_full: false,
            });
        }

        let last_full = completed_fulls.len() == 1 && completed_fulls[0].id == backup.id;

        // Dependents: completed non-full backups between this full and the
        // next one. With no later full the chain extends to the end.
        let next_full_at = completed_fulls
            .iter()
            .filter(|f| f.created_at > backup.created_at)
            .map(|f| f.created_at)
            .min();
        let dependents = all
            .iter()
            .filter(|b| {
                b.status == BackupStatus::Completed
                    && b.backup_type != Some(BackupType::Full)
                    && b.created_at > backup.created_at
                    && next_full_at.map_or(true, |cut| b.created_at < cut)
            })
            .cloned()
            .collect();

        Ok(DeletionImpact {
            backup,
            dependents,
            last_full,
        })
    }

    /// Delete a backup and, for a full backup, its dependent chain.
    ///
    /// The last completed full backup of a cluster can never be deleted.
    /// Deleting a full with dependents requires explicit confirmation;
    /// the returned error carries the dependent count so callers can ask.
    /// Returns the ids of all backups removed.
    pub async fn delete_backup(&self, backup_id: Uuid, confirmed: bool) -> Result<Vec<Uuid>> {
        let impact = self.deletion_impact(backup_id)?;

        // Non-completed rows never made it into the repository; drop the
        // record without a tool call.
        if impact.backup.status != BackupStatus::Completed {
            self.store.mark_backups_deleted(&[impact.backup.id])?;
            return Ok(vec![impact.backup.id]);
        }

        if impact.last_full {
            return Err(HarborError::LastFullBackup(impact.backup.id.to_string()).into());
        }
        if !impact.dependents.is_empty() && !confirmed {
            return Err(
                HarborError::DependentsRequireConfirmation(impact.dependents.len()).into(),
            );
        }

        let cluster = self
            .store
            .get_cluster(impact.backup.cluster_id)?
            .ok_or_else(|| {
                HarborError::Internal(format!("cluster {} not found", impact.backup.cluster_id))
            })?;

        // One expire per set: the tool removes dependents of a full set
        // with it, so dependents only change status locally.
        if let Some(label) = &impact.backup.label {
            let leader = self.leader_host(cluster.id).await?;
            self.remote
                .execute_checked(
                    &leader,
                    &format!("pgbackrest --stanza={} expire --set={}", cluster.stanza(), label),
                    Duration::from_secs(self.config.tool_timeout_secs),
                )
                .await?;
        }

        let mut ids = vec![impact.backup.id];
        ids.extend(impact.dependents.iter().map(|b| b.id));
        self.store.mark_backups_deleted(&ids)?;
        info!(
            "Deleted backup {} and {} dependents from {}",
            impact.backup.id,
            ids.len() - 1,
            cluster.slug
        );
        Ok(ids)
    }

    /// Expire every completed backup past its retention deadline. Failures
    /// are logged per backup and never stop the sweep. Returns the number
    /// of backups expired.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let due = self.store.list_due_expirations(Utc::now())?;
        let mut expired = 0;
        for backup in due {
            match self.expire_one(&backup).await {
                Ok(()) => expired += 1,
                Err(e) => warn!("Could not expire backup {}: {}", backup.id, e),
            }
        }
        if expired > 0 {
            info!("Expired {} backups", expired);
        }
        Ok(expired)
    }

    async fn expire_one(&self, backup: &Backup) -> Result<()> {
        let cluster = self
            .store
            .get_cluster(backup.cluster_id)?
            .ok_or_else(|| {
                HarborError::Internal(format!("cluster {} not found", backup.cluster_id))
            })?;
        if let Some(label) = &backup.label {
            let leader = self.leader_host(cluster.id).await?;
            self.remote
                .execute_checked(
                    &leader,
                    &format!("pgbackrest --stanza={} expire --set={}", cluster.stanza(), label),
                    Duration::from_secs(self.config.tool_timeout_secs),
                )
                .await?;
        }
        self.store.mark_backup_expired(backup.id)?;
        Ok(())
    }

    /// Address of the cluster leader. Backups and expiry must run on the
    /// actual leader, so the advisory fallback is not used here.
    async fn leader_host(&self, cluster_id: Uuid) -> Result<String> {
        let nodes: Vec<Node> = self.store.list_nodes(cluster_id)?;
        self.discovery
            .find_leader(&nodes)
            .await
            .map(|n| n.public_ip)
            .ok_or_else(|| {
                HarborError::Internal(format!("no leader classified for cluster {}", cluster_id))
                    .into()
            })
    }
}
