//! Subprocess execution with bounded timeouts.
//!
//! The executor runs a validated command under a shell profile: the
//! profile's program and fixed argument prefix, then the user command as a
//! single trailing argument. The working directory is always the realpath
//! produced by validation, never the caller's spelling.

pub mod history;
pub mod jobs;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::warn;

use crate::config::ShellProfile;
use crate::sanitize::sanitize_io_error;
use crate::security::ErrorCode;

/// Grace window between the terminate signal and the forced kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("Failed to start command: {0}")]
    Spawn(String),

    #[error("Command timed out after {0} seconds")]
    Timeout(u64),

    #[error("Failed to capture command output streams")]
    Stream,
}

impl ExecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Spawn(_) => ErrorCode::SpawnFailure,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Stream => ErrorCode::StreamFailure,
        }
    }
}

/// Result of a completed (non-timed-out) execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub working_directory: PathBuf,
}

impl ExecOutcome {
    /// Human rendering: quiet success collapses to a fixed phrase, failures
    /// label the exit code and each non-empty stream.
    pub fn format_human(&self) -> String {
        if self.exit_code == 0 {
            if self.stdout.trim().is_empty() && self.stderr.trim().is_empty() {
                return "Command completed successfully (no output)".to_string();
            }
            let mut out = self.stdout.clone();
            if !self.stderr.trim().is_empty() {
                if !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
                out.push_str("stderr:\n");
                out.push_str(&self.stderr);
            }
            return out;
        }

        let mut out = format!("Command exited with code {}", self.exit_code);
        if !self.stdout.trim().is_empty() {
            out.push_str("\n\nstdout:\n");
            out.push_str(&self.stdout);
        }
        if !self.stderr.trim().is_empty() {
            out.push_str("\n\nstderr:\n");
            out.push_str(&self.stderr);
        }
        out
    }
}

pub struct Executor {
    default_timeout: Duration,
}

impl Executor {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `command` under `profile` and wait for exit or timeout.
    ///
    /// Stdin is closed at spawn; stdout and stderr are captured into
    /// separate buffers. A missing exit code (killed by signal) maps to -1.
    pub async fn run(
        &self,
        profile: &ShellProfile,
        command: &str,
        working_dir: &Path,
        env: HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutcome, ExecError> {
        let limit = timeout.unwrap_or(self.default_timeout);

        let mut cmd = Command::new(&profile.command);
        cmd.args(&profile.args)
            .arg(command)
            .current_dir(working_dir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| ExecError::Spawn(sanitize_io_error(&err)))?;

        let mut stdout_pipe = child.stdout.take().ok_or(ExecError::Stream)?;
        let mut stderr_pipe = child.stderr.take().ok_or(ExecError::Stream)?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                return Err(ExecError::Spawn(sanitize_io_error(&err)));
            }
            Err(_) => {
                terminate_child(&mut child).await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(ExecError::Timeout(limit.as_secs()));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(ExecOutcome {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code().unwrap_or(-1),
            working_directory: working_dir.to_path_buf(),
        })
    }
}

/// Cooperative termination: terminate signal first, forced kill after the
/// grace window, and a final wait so the child is always reaped.
pub(crate) async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use rustix::process::{Pid, Signal};
        if let Some(pid) = Pid::from_raw(pid as i32) {
            if rustix::process::kill_process(pid, Signal::TERM).is_ok()
                && tokio::time::timeout(TERMINATE_GRACE, child.wait())
                    .await
                    .is_ok()
            {
                return;
            }
        }
    }

    if let Err(err) = child.kill().await {
        warn!(error = %err, "force kill failed");
    }
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn shell() -> ShellProfile {
        let config = ServerConfig::default();
        config
            .shells
            .get("bash")
            .or_else(|| config.shells.values().next())
            .expect("default shell")
            .clone()
    }

    fn executor() -> Executor {
        Executor::new(Duration::from_secs(30))
    }

    fn env() -> HashMap<String, String> {
        std::env::vars().collect()
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit() {
        let outcome = executor()
            .run(&shell(), "echo hello", Path::new("/tmp"), env(), None)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hello"));
        assert!(outcome.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_captures_stderr_separately() {
        let outcome = executor()
            .run(&shell(), "echo oops 1>&2", Path::new("/tmp"), env(), None)
            .await
            .unwrap();
        assert!(outcome.stdout.is_empty());
        assert!(outcome.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let outcome = executor()
            .run(&shell(), "exit 42", Path::new("/tmp"), env(), None)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 42);
    }

    #[tokio::test]
    async fn test_timeout_terminates() {
        let err = executor()
            .run(
                &shell(),
                "sleep 30",
                Path::new("/tmp"),
                env(),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut profile = shell();
        profile.command = "/nonexistent/shell-binary".to_string();
        let err = executor()
            .run(&profile, "echo hi", Path::new("/tmp"), env(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn(_)));
        // Sanitized: no raw OS spelling, no absolute path echo.
        assert!(!err.to_string().contains("ENOENT"));
    }

    #[tokio::test]
    async fn test_working_directory_applied() {
        let dir = tempfile::tempdir().unwrap();
        let real = std::fs::canonicalize(dir.path()).unwrap();
        let outcome = executor()
            .run(&shell(), "pwd", &real, env(), None)
            .await
            .unwrap();
        assert_eq!(outcome.stdout.trim(), real.to_string_lossy());
        assert_eq!(outcome.working_directory, real);
    }

    #[test]
    fn test_format_quiet_success() {
        let outcome = ExecOutcome {
            stdout: " \n".into(),
            stderr: String::new(),
            exit_code: 0,
            working_directory: PathBuf::from("/tmp"),
        };
        assert_eq!(
            outcome.format_human(),
            "Command completed successfully (no output)"
        );
    }

    #[test]
    fn test_format_failure_labels_streams() {
        let outcome = ExecOutcome {
            stdout: "partial".into(),
            stderr: "boom".into(),
            exit_code: 3,
            working_directory: PathBuf::from("/tmp"),
        };
        let text = outcome.format_human();
        assert!(text.starts_with("Command exited with code 3"));
        assert!(text.contains("stdout:\npartial"));
        assert!(text.contains("stderr:\nboom"));
    }
}
