//! Error types for pgharbor.

use thiserror::Error;

/// Control-plane error taxonomy.
///
/// Three broad classes drive handling policy:
/// - remote-execution failures carry captured stdout/stderr for diagnosis
///   and (upload path only) may be retried with fixed backoff,
/// - state-conflict errors are caller-correctable and never retried,
/// - fatal infrastructure errors abort the whole task.
#[derive(Error, Debug)]
pub enum HarborError {
    #[error("remote command failed on {host} (exit {exit_code}): {stderr}")]
    RemoteCommand {
        host: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("host key mismatch for {host}: pinned {pinned}, presented {presented}")]
    HostKeyMismatch {
        host: String,
        pinned: String,
        presented: String,
    },

    #[error("operation already in flight for cluster {0}")]
    OperationInFlight(String),

    #[error("cluster {0} is in status {1}, expected {2}")]
    WrongClusterStatus(String, String, String),

    #[error("backup {0} is the last completed full backup for its cluster")]
    LastFullBackup(String),

    #[error("backup has {0} dependent backups; deletion requires confirmation")]
    DependentsRequireConfirmation(usize),

    #[error("target time {0} is outside the recovery window [{1}, {2}]")]
    OutsideRecoveryWindow(String, String, String),

    #[error("no quorum after {attempts} attempts: {message}")]
    QuorumTimeout { attempts: u32, message: String },

    #[error("no leader elected within {attempts} attempts")]
    LeaderElectionTimeout { attempts: u32 },

    #[error("node {host} unreachable after {attempts} attempts")]
    NodeUnreachable { host: String, attempts: u32 },

    #[error("cloud provider error: {0}")]
    Cloud(String),

    #[error("DNS provider error: {0}")]
    Dns(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HarborError {
    /// True for errors the caller can correct by changing the request
    /// (wrong status, conflicting operation, protected backup). These are
    /// never retried automatically.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            HarborError::OperationInFlight(_)
                | HarborError::WrongClusterStatus(..)
                | HarborError::LastFullBackup(_)
                | HarborError::DependentsRequireConfirmation(_)
                | HarborError::OutsideRecoveryWindow(..)
        )
    }

    /// True for remote-execution failures eligible for bounded retry on
    /// the backup-upload path.
    pub fn is_retryable_remote(&self) -> bool {
        matches!(self, HarborError::RemoteCommand { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(HarborError::OperationInFlight("c1".into()).is_conflict());
        assert!(HarborError::LastFullBackup("b1".into()).is_conflict());
        assert!(!HarborError::QuorumTimeout {
            attempts: 30,
            message: "2/3 healthy".into()
        }
        .is_conflict());
    }

    #[test]
    fn test_remote_retry_classification() {
        let err = HarborError::RemoteCommand {
            host: "10.0.0.1".into(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "connection reset".into(),
        };
        assert!(err.is_retryable_remote());
        assert!(!HarborError::Dns("zone missing".into()).is_retryable_remote());
    }
}
