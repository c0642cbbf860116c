//! Remote command and file-transfer primitive.
//!
//! Everything the control plane does to a node goes through
//! [`RemoteExecutor`]; the [`TrustedExecutor`] wrapper performs the
//! trust-on-first-use host-key check before every call and refuses to
//! proceed on a mismatch.

use async_trait::async_trait;
use harbor_common::HarborError;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::trust::TrustStore;

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Authenticated channel to a remote host: key handshake, command
/// execution with a timeout, and file upload.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Fetch the host key the remote side presents for this connection.
    async fn handshake(&self, host: &str) -> Result<Vec<u8>, HarborError>;

    /// Run a command, returning the captured exit code and output. A
    /// non-zero exit is not an error at this layer; callers decide.
    async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, HarborError>;

    /// Upload `content` to `path` with the given octal mode.
    async fn upload(
        &self,
        host: &str,
        path: &str,
        content: &str,
        mode: &str,
    ) -> Result<(), HarborError>;
}

/// SSH-based executor shelling out to the system ssh client.
pub struct SshExecutor {
    user: String,
}

impl SshExecutor {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
        }
    }

    fn ssh_target(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    async fn run_with_timeout(
        mut cmd: Command,
        stdin_data: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutput, HarborError> {
        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data.as_bytes()).await?;
                // Close stdin so the remote `cat` terminates.
                drop(stdin);
            }
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Ok(CommandOutput {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: format!("timed out after {}s", timeout.as_secs()),
                });
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn handshake(&self, host: &str) -> Result<Vec<u8>, HarborError> {
        let mut cmd = Command::new("ssh-keyscan");
        cmd.args(["-T", "5", "-t", "ed25519", host]);
        let out = Self::run_with_timeout(cmd, None, Duration::from_secs(10)).await?;
        // ssh-keyscan prints "<host> <type> <base64-key>" per key
        for line in out.stdout.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() == 3 && fields[1] == "ssh-ed25519" {
                return Ok(format!("{} {}", fields[1], fields[2]).into_bytes());
            }
        }
        Err(HarborError::RemoteCommand {
            host: host.to_string(),
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: format!("no host key presented: {}", out.stderr),
        })
    }

    async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, HarborError> {
        debug!("exec on {}: {}", host, command);
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ConnectTimeout=10",
            &self.ssh_target(host),
            command,
        ]);
        Self::run_with_timeout(cmd, None, timeout).await
    }

    async fn upload(
        &self,
        host: &str,
        path: &str,
        content: &str,
        mode: &str,
    ) -> Result<(), HarborError> {
        debug!("upload {} bytes to {}:{}", content.len(), host, path);
        let script = format!(
            "umask 077 && mkdir -p $(dirname {path}) && cat > {path} && chmod {mode} {path}",
            path = path,
            mode = mode
        );
        let mut cmd = Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "ConnectTimeout=10",
            &self.ssh_target(host),
            &script,
        ]);
        let out = Self::run_with_timeout(cmd, Some(content), Duration::from_secs(60)).await?;
        if out.success() {
            Ok(())
        } else {
            Err(HarborError::RemoteCommand {
                host: host.to_string(),
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            })
        }
    }
}

/// TOFU-gated executor: every operation verifies the presented host key
/// against the pinned fingerprint before touching the channel.
pub struct TrustedExecutor {
    inner: Arc<dyn RemoteExecutor>,
    trust: Arc<TrustStore>,
}

impl TrustedExecutor {
    pub fn new(inner: Arc<dyn RemoteExecutor>, trust: Arc<TrustStore>) -> Self {
        Self { inner, trust }
    }

    async fn verify_host(&self, host: &str) -> Result<(), HarborError> {
        let key = self.inner.handshake(host).await?;
        self.trust.verify(host, &key).await
    }

    pub async fn execute(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, HarborError> {
        self.verify_host(host).await?;
        self.inner.execute(host, command, timeout).await
    }

    /// Run a command and turn a non-zero exit into an error carrying the
    /// captured stdout/stderr for diagnosis.
    pub async fn execute_checked(
        &self,
        host: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, HarborError> {
        let out = self.execute(host, command, timeout).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(HarborError::RemoteCommand {
                host: host.to_string(),
                exit_code: out.exit_code,
                stdout: out.stdout,
                stderr: out.stderr,
            })
        }
    }

    pub async fn upload(
        &self,
        host: &str,
        path: &str,
        content: &str,
        mode: &str,
    ) -> Result<(), HarborError> {
        self.verify_host(host).await?;
        self.inner.upload(host, path, content, mode).await
    }
}
