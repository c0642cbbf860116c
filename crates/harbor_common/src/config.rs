//! Configuration for harbord.
//!
//! Loads settings from /etc/pgharbor/config.toml or uses defaults.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/pgharbor/config.toml";

/// Cloud provider API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// API base URL
    #[serde(default = "default_cloud_api_url")]
    pub api_url: String,

    /// API token
    #[serde(default)]
    pub api_token: String,

    /// Prebuilt image name the nodes boot from
    #[serde(default = "default_image")]
    pub image: String,

    /// SSH key name registered at the provider
    #[serde(default = "default_ssh_key")]
    pub ssh_key: String,
}

fn default_cloud_api_url() -> String {
    "https://api.hetzner.cloud/v1".to_string()
}

fn default_image() -> String {
    "pgharbor-node-v4".to_string()
}

fn default_ssh_key() -> String {
    "pgharbor-control".to_string()
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_url: default_cloud_api_url(),
            api_token: String::new(),
            image: default_image(),
            ssh_key: default_ssh_key(),
        }
    }
}

/// DNS provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub api_token: String,

    /// Zone id the cluster records live in
    #[serde(default)]
    pub zone_id: String,

    /// Domain suffix for published hostnames (slug.domain)
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Synchronizer sweep period in seconds
    #[serde(default = "default_dns_sync_interval")]
    pub sync_interval_secs: u64,

    /// Record TTL in seconds
    #[serde(default = "default_dns_ttl")]
    pub record_ttl_secs: u32,
}

fn default_dns_api_url() -> String {
    "https://dns.hetzner.com/api/v1".to_string()
}

fn default_domain() -> String {
    "db.pgharbor.io".to_string()
}

fn default_dns_sync_interval() -> u64 {
    30
}

fn default_dns_ttl() -> u32 {
    60
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            api_url: default_dns_api_url(),
            api_token: String::new(),
            zone_id: String::new(),
            domain: default_domain(),
            sync_interval_secs: default_dns_sync_interval(),
            record_ttl_secs: default_dns_ttl(),
        }
    }
}

/// Bounded-wait budgets for provisioning. Every wait is attempts x interval;
/// exceeding a budget is a fatal, reported error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    /// Attempts waiting for a node to answer over the remote channel
    #[serde(default = "default_reach_attempts")]
    pub reachability_attempts: u32,

    /// Seconds between reachability attempts
    #[serde(default = "default_reach_interval")]
    pub reachability_interval_secs: u64,

    /// Attempts waiting for consensus-store quorum
    #[serde(default = "default_quorum_attempts")]
    pub quorum_attempts: u32,

    #[serde(default = "default_quorum_interval")]
    pub quorum_interval_secs: u64,

    /// Attempts polling for an elected leader (~5 minutes at 5s)
    #[serde(default = "default_leader_attempts")]
    pub leader_attempts: u32,

    #[serde(default = "default_leader_interval")]
    pub leader_interval_secs: u64,

    /// Per-command timeout on the remote channel, in seconds
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,
}

fn default_reach_attempts() -> u32 {
    30
}

fn default_reach_interval() -> u64 {
    10
}

fn default_quorum_attempts() -> u32 {
    30
}

fn default_quorum_interval() -> u64 {
    5
}

fn default_leader_attempts() -> u32 {
    60
}

fn default_leader_interval() -> u64 {
    5
}

fn default_remote_timeout() -> u64 {
    60
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            reachability_attempts: default_reach_attempts(),
            reachability_interval_secs: default_reach_interval(),
            quorum_attempts: default_quorum_attempts(),
            quorum_interval_secs: default_quorum_interval(),
            leader_attempts: default_leader_attempts(),
            leader_interval_secs: default_leader_interval(),
            remote_timeout_secs: default_remote_timeout(),
        }
    }
}

/// Backup retention and execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Retention cycles for daily (differential) backups, in days
    #[serde(default = "default_daily_cycles")]
    pub daily_retention_days: u32,

    /// Retention cycles for weekly full backups, in weeks
    #[serde(default = "default_weekly_cycles")]
    pub weekly_retention_weeks: u32,

    /// Retention cycles for monthly full backups, in months (30-day months)
    #[serde(default = "default_monthly_cycles")]
    pub monthly_retention_months: u32,

    /// Expiration sweep period in seconds
    #[serde(default = "default_expiry_sweep_interval")]
    pub expiry_sweep_interval_secs: u64,

    /// Upload retry attempts (the only automatically retried remote path)
    #[serde(default = "default_upload_retries")]
    pub upload_retries: u32,

    /// Fixed backoff between upload retries, in seconds
    #[serde(default = "default_upload_backoff")]
    pub upload_backoff_secs: u64,

    /// Timeout for one backup tool invocation, in seconds
    #[serde(default = "default_backup_timeout")]
    pub tool_timeout_secs: u64,

    /// Bounded wait for the database to come back after in-place restore
    #[serde(default = "default_restore_ready_attempts")]
    pub restore_ready_attempts: u32,

    #[serde(default = "default_restore_ready_interval")]
    pub restore_ready_interval_secs: u64,
}

fn default_daily_cycles() -> u32 {
    7
}

fn default_weekly_cycles() -> u32 {
    4
}

fn default_monthly_cycles() -> u32 {
    12
}

fn default_expiry_sweep_interval() -> u64 {
    3600
}

fn default_upload_retries() -> u32 {
    3
}

fn default_upload_backoff() -> u64 {
    10
}

fn default_backup_timeout() -> u64 {
    3600
}

fn default_restore_ready_attempts() -> u32 {
    60
}

fn default_restore_ready_interval() -> u64 {
    5
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            daily_retention_days: default_daily_cycles(),
            weekly_retention_weeks: default_weekly_cycles(),
            monthly_retention_months: default_monthly_cycles(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval(),
            upload_retries: default_upload_retries(),
            upload_backoff_secs: default_upload_backoff(),
            tool_timeout_secs: default_backup_timeout(),
            restore_ready_attempts: default_restore_ready_attempts(),
            restore_ready_interval_secs: default_restore_ready_interval(),
        }
    }
}

/// Leader discovery timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    /// Per-node status query timeout, in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Overall fan-out deadline, slightly larger than the per-node timeout
    #[serde(default = "default_overall_deadline")]
    pub overall_deadline_secs: u64,

    /// Failover controller status port
    #[serde(default = "default_controller_port")]
    pub controller_port: u16,
}

fn default_probe_timeout() -> u64 {
    2
}

fn default_overall_deadline() -> u64 {
    3
}

fn default_controller_port() -> u16 {
    8008
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            overall_deadline_secs: default_overall_deadline(),
            controller_port: default_controller_port(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of background worker tasks
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Outbox poll period in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_workers() -> u32 {
    4
}

fn default_poll_interval() -> u64 {
    2
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// Top-level harbord configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarborConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub provision: ProvisionConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub leader: LeaderConfig,

    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_db_path() -> String {
    "/var/lib/pgharbor/harbor.db".to_string()
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cloud: CloudConfig::default(),
            dns: DnsConfig::default(),
            provision: ProvisionConfig::default(),
            backup: BackupConfig::default(),
            leader: LeaderConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl HarborConfig {
    /// Load config from the default path, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(CONFIG_PATH)
    }

    /// Load config from a specific path. Missing file means defaults;
    /// a file that fails to parse is reported and replaced by defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(raw) => match toml::from_str::<HarborConfig>(&raw) {
                Ok(cfg) => {
                    info!("Loaded config from {}", path.display());
                    cfg
                }
                Err(e) => {
                    warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Serialize the current config back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = HarborConfig::default();
        assert_eq!(cfg.db_path, "/var/lib/pgharbor/harbor.db");
        assert_eq!(cfg.backup.daily_retention_days, 7);
        assert_eq!(cfg.leader.probe_timeout_secs, 2);
        assert!(cfg.leader.overall_deadline_secs > cfg.leader.probe_timeout_secs);
        assert_eq!(cfg.dns.sync_interval_secs, 30);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
db_path = "/tmp/test.db"

[backup]
daily_retention_days = 14
"#,
        )
        .unwrap();

        let cfg = HarborConfig::load_from(&path);
        assert_eq!(cfg.db_path, "/tmp/test.db");
        assert_eq!(cfg.backup.daily_retention_days, 14);
        // Untouched sections keep defaults
        assert_eq!(cfg.backup.weekly_retention_weeks, 4);
        assert_eq!(cfg.worker.workers, 4);
    }

    #[test]
    fn test_garbage_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not { valid toml").unwrap();

        let cfg = HarborConfig::load_from(&path);
        assert_eq!(cfg.db_path, "/var/lib/pgharbor/harbor.db");
    }

    #[test]
    fn test_roundtrip() {
        let cfg = HarborConfig::default();
        let raw = cfg.to_toml().unwrap();
        let back: HarborConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.backup.upload_retries, cfg.backup.upload_retries);
    }
}
