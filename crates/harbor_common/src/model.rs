//! Domain model for the pgharbor control plane.
//!
//! Clusters, nodes, backups, restore jobs, and trusted host keys. Status
//! enums round-trip through their `as_str`/`parse` pairs so the store can
//! keep readable strings in SQLite.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// CLUSTER
// ============================================================================

/// Cluster lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Pending,
    Creating,
    Running,
    Error,
    Deleting,
    Deleted,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "PENDING",
            ClusterStatus::Creating => "CREATING",
            ClusterStatus::Running => "RUNNING",
            ClusterStatus::Error => "ERROR",
            ClusterStatus::Deleting => "DELETING",
            ClusterStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ClusterStatus::Pending),
            "CREATING" => Some(ClusterStatus::Creating),
            "RUNNING" => Some(ClusterStatus::Running),
            "ERROR" => Some(ClusterStatus::Error),
            "DELETING" => Some(ClusterStatus::Deleting),
            "DELETED" => Some(ClusterStatus::Deleted),
            _ => None,
        }
    }

    /// Terminal states: progress bookkeeping stops here.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClusterStatus::Running | ClusterStatus::Error | ClusterStatus::Deleted
        )
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported PostgreSQL major versions (must match the prebuilt VM image).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostgresVersion {
    #[serde(rename = "15")]
    V15,
    #[serde(rename = "16")]
    V16,
    #[serde(rename = "17")]
    V17,
}

impl PostgresVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostgresVersion::V15 => "15",
            PostgresVersion::V16 => "16",
            PostgresVersion::V17 => "17",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "15" => Some(PostgresVersion::V15),
            "16" => Some(PostgresVersion::V16),
            "17" => Some(PostgresVersion::V17),
            _ => None,
        }
    }
}

impl fmt::Display for PostgresVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node size class. Drives both the provider server type and the database
/// tuning baked into the failover-controller config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSize {
    Small,
    Medium,
    Large,
}

impl NodeSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeSize::Small => "small",
            NodeSize::Medium => "medium",
            NodeSize::Large => "large",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "small" => Some(NodeSize::Small),
            "medium" => Some(NodeSize::Medium),
            "large" => Some(NodeSize::Large),
            _ => None,
        }
    }

    /// Cloud provider server type for this size class.
    pub fn server_type(&self) -> &'static str {
        match self {
            NodeSize::Small => "cpx21",
            NodeSize::Medium => "cpx31",
            NodeSize::Large => "cpx41",
        }
    }

    /// `shared_buffers` setting scaled to the instance memory.
    pub fn shared_buffers(&self) -> &'static str {
        match self {
            NodeSize::Small => "1GB",
            NodeSize::Medium => "2GB",
            NodeSize::Large => "4GB",
        }
    }

    /// `max_connections` scaled to the instance size.
    pub fn max_connections(&self) -> u32 {
        match self {
            NodeSize::Small => 100,
            NodeSize::Medium => 200,
            NodeSize::Large => 400,
        }
    }
}

/// A managed PostgreSQL HA cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    /// Stable name: DNS records and the backup stanza key off this.
    pub slug: String,
    pub name: String,
    /// Owning principal.
    pub owner_id: Uuid,
    pub status: ClusterStatus,
    pub node_count: u32,
    pub node_size: NodeSize,
    pub region: String,
    pub postgres_version: PostgresVersion,
    /// Published hostname, absent until DNS has been set up.
    pub hostname: Option<String>,
    pub port: u16,
    /// Superuser credential, generated at creation.
    pub admin_password: String,
    pub provisioning_step: Option<String>,
    /// Monotonic 0..=100 until a terminal status is reached.
    pub provisioning_progress: u8,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// Build a new PENDING cluster with generated slug and credential.
    pub fn new(
        name: &str,
        owner_id: Uuid,
        node_count: u32,
        node_size: NodeSize,
        region: &str,
        postgres_version: PostgresVersion,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            slug: derive_slug(name),
            name: name.to_string(),
            owner_id,
            status: ClusterStatus::Pending,
            node_count,
            node_size,
            region: region.to_string(),
            postgres_version,
            hostname: None,
            port: 5432,
            admin_password: generate_password(32),
            provisioning_step: None,
            provisioning_progress: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Backup stanza name for this cluster.
    pub fn stanza(&self) -> String {
        self.slug.clone()
    }
}

// ============================================================================
// NODE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Provisioning,
    Active,
    Deleting,
    Deleted,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Provisioning => "PROVISIONING",
            NodeStatus::Active => "ACTIVE",
            NodeStatus::Deleting => "DELETING",
            NodeStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROVISIONING" => Some(NodeStatus::Provisioning),
            "ACTIVE" => Some(NodeStatus::Active),
            "DELETING" => Some(NodeStatus::Deleting),
            "DELETED" => Some(NodeStatus::Deleted),
            _ => None,
        }
    }
}

/// One virtual machine inside a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub name: String,
    pub public_ip: String,
    pub private_ip: String,
    pub status: NodeStatus,
    /// Cloud provider instance id.
    pub provider_id: Option<String>,
    /// Informational only. The authoritative role always comes from leader
    /// discovery, never from this field.
    pub role_hint: Option<Role>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// ROLE
// ============================================================================

/// Database role as reported by the failover controller.
///
/// The controller's status endpoint labels the leader inconsistently
/// ("leader", "master", "primary", with mixed casing). All of those collapse
/// to `Leader` here; if a controller ever distinguishes a transient
/// promotion state a new variant can be added without touching call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Replica,
    Unknown,
}

impl Role {
    /// Structured role classification from a controller label.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "leader" | "master" | "primary" => Role::Leader,
            "replica" | "standby" | "sync_standby" | "secondary" => Role::Replica,
            _ => Role::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leader => "leader",
            Role::Replica => "replica",
            Role::Unknown => "unknown",
        }
    }
}

// ============================================================================
// BACKUP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Deleted,
    Expired,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "PENDING",
            BackupStatus::InProgress => "IN_PROGRESS",
            BackupStatus::Completed => "COMPLETED",
            BackupStatus::Failed => "FAILED",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BackupStatus::Pending),
            "IN_PROGRESS" => Some(BackupStatus::InProgress),
            "COMPLETED" => Some(BackupStatus::Completed),
            "FAILED" => Some(BackupStatus::Failed),
            "DELETED" => Some(BackupStatus::Deleted),
            "EXPIRED" => Some(BackupStatus::Expired),
            _ => None,
        }
    }

    /// PENDING or IN_PROGRESS: counts against the one-in-flight guard.
    pub fn is_active(&self) -> bool {
        matches!(self, BackupStatus::Pending | BackupStatus::InProgress)
    }
}

/// Backup type as understood by the backup tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    #[serde(alias = "diff")]
    Differential,
    #[serde(alias = "incr")]
    Incremental,
}

impl BackupType {
    /// Argument form the backup tool expects (`--type=...`).
    pub fn as_tool_arg(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Differential => "diff",
            BackupType::Incremental => "incr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(BackupType::Full),
            "diff" | "differential" => Some(BackupType::Differential),
            "incr" | "incremental" => Some(BackupType::Incremental),
            _ => None,
        }
    }
}

/// How a backup came to exist. Drives both type inference and retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupOrigin {
    Manual,
    ScheduledDaily,
    ScheduledWeekly,
    ScheduledMonthly,
}

impl BackupOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupOrigin::Manual => "MANUAL",
            BackupOrigin::ScheduledDaily => "SCHEDULED_DAILY",
            BackupOrigin::ScheduledWeekly => "SCHEDULED_WEEKLY",
            BackupOrigin::ScheduledMonthly => "SCHEDULED_MONTHLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MANUAL" => Some(BackupOrigin::Manual),
            "SCHEDULED_DAILY" => Some(BackupOrigin::ScheduledDaily),
            "SCHEDULED_WEEKLY" => Some(BackupOrigin::ScheduledWeekly),
            "SCHEDULED_MONTHLY" => Some(BackupOrigin::ScheduledMonthly),
            _ => None,
        }
    }

    /// Schedule-derived backup type, used when the caller did not request
    /// one explicitly. Weekly and monthly schedules anchor new chains with
    /// a full backup; daily produces differentials against the last full.
    pub fn inferred_type(&self) -> BackupType {
        match self {
            BackupOrigin::ScheduledWeekly | BackupOrigin::ScheduledMonthly => BackupType::Full,
            BackupOrigin::ScheduledDaily => BackupType::Differential,
            BackupOrigin::Manual => BackupType::Incremental,
        }
    }
}

/// Sub-steps of a running backup, each persisted at its boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStep {
    Preparing,
    Transferring,
    Uploading,
    Verifying,
}

impl BackupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStep::Preparing => "preparing",
            BackupStep::Transferring => "transferring",
            BackupStep::Uploading => "uploading",
            BackupStep::Verifying => "verifying",
        }
    }

    pub fn progress(&self) -> u8 {
        match self {
            BackupStep::Preparing => 10,
            BackupStep::Transferring => 40,
            BackupStep::Uploading => 70,
            BackupStep::Verifying => 90,
        }
    }
}

/// One backup of one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub origin: BackupOrigin,
    /// What the caller asked for, if anything.
    pub requested_type: Option<BackupType>,
    /// What the tool actually produced. May differ from `requested_type`
    /// (the tool promotes to full when no prior chain exists).
    pub backup_type: Option<BackupType>,
    pub status: BackupStatus,
    pub step: Option<BackupStep>,
    pub progress: u8,
    /// Tool-assigned backup label.
    pub label: Option<String>,
    pub size_bytes: Option<u64>,
    pub wal_start: Option<String>,
    pub wal_stop: Option<String>,
    /// Achievable point-in-time recovery window.
    pub recovery_window_start: Option<DateTime<Utc>>,
    pub recovery_window_stop: Option<DateTime<Utc>>,
    /// None = never auto-expires (manual backups).
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Backup {
    pub fn new(cluster_id: Uuid, origin: BackupOrigin, requested_type: Option<BackupType>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            origin,
            requested_type,
            backup_type: None,
            status: BackupStatus::Pending,
            step: None,
            progress: 0,
            label: None,
            size_bytes: None,
            wal_start: None,
            wal_stop: None,
            recovery_window_start: None,
            recovery_window_stop: None,
            expires_at: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Effective backup type: explicit request wins over schedule inference.
    pub fn effective_type(&self) -> BackupType {
        self.requested_type.unwrap_or_else(|| self.origin.inferred_type())
    }
}

// ============================================================================
// RESTORE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RestoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStatus::Pending => "PENDING",
            RestoreStatus::InProgress => "IN_PROGRESS",
            RestoreStatus::Completed => "COMPLETED",
            RestoreStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RestoreStatus::Pending),
            "IN_PROGRESS" => Some(RestoreStatus::InProgress),
            "COMPLETED" => Some(RestoreStatus::Completed),
            "FAILED" => Some(RestoreStatus::Failed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RestoreStatus::Pending | RestoreStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreType {
    Full,
    PointInTime,
}

impl RestoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreType::Full => "FULL",
            RestoreType::PointInTime => "POINT_IN_TIME",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FULL" => Some(RestoreType::Full),
            "POINT_IN_TIME" => Some(RestoreType::PointInTime),
            _ => None,
        }
    }
}

/// A restore of one backup, either in place or into a new cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreJob {
    pub id: Uuid,
    /// Source cluster the backup belongs to.
    pub cluster_id: Uuid,
    /// Set when restoring into a freshly provisioned cluster.
    pub target_cluster_id: Option<Uuid>,
    pub backup_id: Uuid,
    pub restore_type: RestoreType,
    pub target_time: Option<DateTime<Utc>>,
    pub status: RestoreStatus,
    pub step: Option<String>,
    pub progress: u8,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RestoreJob {
    pub fn new(
        cluster_id: Uuid,
        backup_id: Uuid,
        restore_type: RestoreType,
        target_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            target_cluster_id: None,
            backup_id,
            restore_type,
            target_time,
            status: RestoreStatus::Pending,
            step: None,
            progress: 0,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// TRUSTED HOST KEY
// ============================================================================

/// A pinned host-key fingerprint (trust on first use).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedHostKey {
    pub host: String,
    /// Hex-encoded SHA-256 of the presented host key.
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_verified: DateTime<Utc>,
}

// ============================================================================
// HELPERS
// ============================================================================

/// Derive a DNS-safe slug from a display name: lowercased, dash-separated,
/// with a short random suffix so recreated clusters never collide.
pub fn derive_slug(name: &str) -> String {
    let base: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let base = base.trim_matches('-').to_string();
    let base = if base.is_empty() { "cluster".to_string() } else { base };
    format!("{}-{}", base, random_suffix(6))
}

/// Generate a random alphanumeric credential.
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

fn random_suffix(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_label_classification() {
        assert_eq!(Role::from_label("leader"), Role::Leader);
        assert_eq!(Role::from_label("Master"), Role::Leader);
        assert_eq!(Role::from_label(" PRIMARY "), Role::Leader);
        assert_eq!(Role::from_label("replica"), Role::Replica);
        assert_eq!(Role::from_label("sync_standby"), Role::Replica);
        assert_eq!(Role::from_label("promoting"), Role::Unknown);
        assert_eq!(Role::from_label(""), Role::Unknown);
    }

    #[test]
    fn test_effective_backup_type_inference() {
        // No explicit request: schedule decides.
        let daily = Backup::new(Uuid::new_v4(), BackupOrigin::ScheduledDaily, None);
        assert_eq!(daily.effective_type(), BackupType::Differential);

        let weekly = Backup::new(Uuid::new_v4(), BackupOrigin::ScheduledWeekly, None);
        assert_eq!(weekly.effective_type(), BackupType::Full);

        let monthly = Backup::new(Uuid::new_v4(), BackupOrigin::ScheduledMonthly, None);
        assert_eq!(monthly.effective_type(), BackupType::Full);

        let manual = Backup::new(Uuid::new_v4(), BackupOrigin::Manual, None);
        assert_eq!(manual.effective_type(), BackupType::Incremental);
    }

    #[test]
    fn test_explicit_type_overrides_schedule() {
        let b = Backup::new(
            Uuid::new_v4(),
            BackupOrigin::ScheduledDaily,
            Some(BackupType::Full),
        );
        assert_eq!(b.effective_type(), BackupType::Full);
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [
            ClusterStatus::Pending,
            ClusterStatus::Creating,
            ClusterStatus::Running,
            ClusterStatus::Error,
            ClusterStatus::Deleting,
            ClusterStatus::Deleted,
        ] {
            assert_eq!(ClusterStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ClusterStatus::parse("RESTARTING"), None);
    }

    #[test]
    fn test_slug_is_dns_safe() {
        let slug = derive_slug("My Production DB!");
        assert!(slug.starts_with("my-production-db-"));
        assert!(slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));

        let fallback = derive_slug("***");
        assert!(fallback.starts_with("cluster-"));
    }

    #[test]
    fn test_new_cluster_defaults() {
        let c = Cluster::new(
            "orders",
            Uuid::new_v4(),
            3,
            NodeSize::Medium,
            "fsn1",
            PostgresVersion::V16,
        );
        assert_eq!(c.status, ClusterStatus::Pending);
        assert_eq!(c.port, 5432);
        assert_eq!(c.provisioning_progress, 0);
        assert_eq!(c.admin_password.len(), 32);
        assert!(c.hostname.is_none());
    }
}
