//! A pooled SSH connection.
//!
//! Connections are lazy: the transport is established on the first command.
//! Host keys are checked against the TOFU store during the handshake. A
//! transport failure drops the handle and hands the connection to the
//! reconnect loop; once the attempt budget is exhausted the connection is
//! permanently failed and reports itself to the pool by id (the pool owns
//! connections — there is no back-pointer).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::ChannelMsg;
use russh::client;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{IDLE_CUTOFF, ReconnectSchedule};
use super::error::SshError;
use super::known_hosts::KnownHostsStore;
use crate::config::{SshConnectionConfig, SshSettings};
use crate::sanitize::sanitize_message;

/// Shell flavor detected on the remote end. `Unknown` is sticky and
/// fail-closed: callers must apply the most restrictive rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedShell {
    Bash,
    Sh,
    PowerShell,
    Cmd,
    Unknown,
}

impl DetectedShell {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Sh => "sh",
            Self::PowerShell => "powershell",
            Self::Cmd => "cmd",
            Self::Unknown => "unknown",
        }
    }
}

/// Classify the outputs of the two detection probes: `echo $SHELL` first,
/// `$PSVersionTable.PSVersion` as the fallback.
pub fn classify_shell_probe(shell_probe: &str, ps_probe: &str) -> DetectedShell {
    let shell = shell_probe.trim();
    if !shell.is_empty() && shell != "$SHELL" {
        let lower = shell.to_ascii_lowercase();
        if lower.contains("bash") {
            return DetectedShell::Bash;
        }
        if lower.ends_with("/sh") || lower == "sh" {
            return DetectedShell::Sh;
        }
        if lower.contains("cmd") {
            return DetectedShell::Cmd;
        }
    }
    let ps = ps_probe.trim();
    if !ps.is_empty() && ps.chars().any(|c| c.is_ascii_digit()) {
        return DetectedShell::PowerShell;
    }
    DetectedShell::Unknown
}

#[derive(Debug, Clone)]
pub struct SshCommandOutput {
    /// Interleaved stdout and stderr, as produced by the remote.
    pub output: String,
    pub exit_code: i32,
}

struct HostKeyHandler {
    known_hosts: Arc<KnownHostsStore>,
    host: String,
    port: u16,
    strict: bool,
    /// Rich rejection stashed for the connect caller; the handler itself
    /// can only answer yes/no.
    rejection: Arc<std::sync::Mutex<Option<SshError>>>,
}

impl HostKeyHandler {
    fn stash(&self, err: SshError) {
        let mut slot = self
            .rejection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(err);
    }
}

#[async_trait]
impl client::Handler for HostKeyHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Ok(key_bytes) = server_public_key.to_bytes() else {
            self.stash(SshError::Transport(
                "could not encode server public key".into(),
            ));
            return Ok(false);
        };
        match self
            .known_hosts
            .verify(&self.host, self.port, &key_bytes, self.strict)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                self.stash(err);
                Ok(false)
            }
        }
    }
}

pub struct SshConnection {
    id: String,
    config: SshConnectionConfig,
    settings: SshSettings,
    known_hosts: Arc<KnownHostsStore>,
    strict: bool,
    handle: Mutex<Option<client::Handle<HostKeyHandler>>>,
    detected_shell: Mutex<Option<DetectedShell>>,
    last_activity: std::sync::Mutex<Instant>,
    reconnect_attempts: AtomicU32,
    failed: AtomicBool,
    reconnecting: AtomicBool,
    failure_tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl SshConnection {
    pub fn new(
        id: String,
        config: SshConnectionConfig,
        settings: SshSettings,
        known_hosts: Arc<KnownHostsStore>,
        failure_tx: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let strict = config
            .strict_host_key_checking
            .unwrap_or(settings.strict_host_key_checking);
        Self {
            id,
            config,
            settings,
            known_hosts,
            strict,
            handle: Mutex::new(None),
            detected_shell: Mutex::new(None),
            last_activity: std::sync::Mutex::new(Instant::now()),
            reconnect_attempts: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            failure_tx,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn strict_host_key_checking(&self) -> bool {
        self.strict
    }

    pub fn touch(&self) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        let last = self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last.elapsed()
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    pub async fn detected_shell(&self) -> DetectedShell {
        self.detected_shell
            .lock()
            .await
            .unwrap_or(DetectedShell::Unknown)
    }

    async fn open_handle(&self) -> Result<client::Handle<HostKeyHandler>, SshError> {
        let rejection = Arc::new(std::sync::Mutex::new(None));
        let handler = HostKeyHandler {
            known_hosts: Arc::clone(&self.known_hosts),
            host: self.config.host.clone(),
            port: self.config.port,
            strict: self.strict,
            rejection: Arc::clone(&rejection),
        };

        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(self.settings.keepalive_interval)),
            keepalive_max: self.settings.keepalive_count_max,
            ..Default::default()
        });

        let connecting = client::connect(
            ssh_config,
            (self.config.host.as_str(), self.config.port),
            handler,
        );
        let ready_timeout = Duration::from_secs(self.settings.ready_timeout);
        let mut handle = match tokio::time::timeout(ready_timeout, connecting).await {
            Err(_) => {
                return Err(SshError::Transport(format!(
                    "connection not ready within {} seconds",
                    ready_timeout.as_secs()
                )));
            }
            Ok(Err(err)) => {
                let stashed = rejection
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                return Err(stashed.unwrap_or_else(|| err.into()));
            }
            Ok(Ok(handle)) => handle,
        };

        let authenticated = if let Some(key_path) = &self.config.private_key_path {
            let key = load_secret_key(key_path, None)
                .map_err(|err| SshError::Transport(sanitize_message(&err.to_string())))?;
            handle
                .authenticate_publickey(
                    self.config.username.as_str(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await?
        } else if let Some(password) = &self.config.password {
            handle
                .authenticate_password(self.config.username.as_str(), password.as_str())
                .await?
        } else {
            return Err(SshError::AuthenticationFailed {
                user: self.config.username.clone(),
            });
        };

        if !authenticated {
            return Err(SshError::AuthenticationFailed {
                user: self.config.username.clone(),
            });
        }

        debug!(connection = %self.id, host = %self.config.host, "ssh transport ready");
        Ok(handle)
    }

    async fn run_remote(
        &self,
        handle: &client::Handle<HostKeyHandler>,
        command: &str,
        env: Option<&HashMap<String, String>>,
    ) -> Result<SshCommandOutput, SshError> {
        let mut channel = handle.channel_open_session().await?;

        if let Some(env) = env {
            for (name, value) in env {
                // Servers commonly refuse env requests; that is not fatal.
                let _ = channel.set_env(false, name.as_str(), value.as_str()).await;
            }
        }

        channel.exec(true, command).await?;

        let mut output = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                _ => {}
            }
        }

        Ok(SshCommandOutput {
            output: String::from_utf8_lossy(&output).into_owned(),
            exit_code: exit_code.unwrap_or(-1),
        })
    }

    /// Detect the remote shell once per connection lifetime. The result —
    /// including `Unknown` — is sticky.
    async fn ensure_shell_detected(&self, handle: &client::Handle<HostKeyHandler>) {
        let mut detected = self.detected_shell.lock().await;
        if detected.is_some() {
            return;
        }
        let shell_probe = self
            .run_remote(handle, "echo $SHELL", None)
            .await
            .map(|out| out.output)
            .unwrap_or_default();
        let needs_ps_probe = classify_shell_probe(&shell_probe, "") == DetectedShell::Unknown;
        let ps_probe = if needs_ps_probe {
            self.run_remote(handle, "$PSVersionTable.PSVersion", None)
                .await
                .map(|out| out.output)
                .unwrap_or_default()
        } else {
            String::new()
        };
        let shell = classify_shell_probe(&shell_probe, &ps_probe);
        info!(connection = %self.id, shell = shell.as_str(), "remote shell detected");
        *detected = Some(shell);
    }

    /// Execute a command, lazily connecting first. Transport failures drop
    /// the handle and start the reconnect loop.
    pub async fn execute(
        self: &Arc<Self>,
        command: &str,
        env: Option<&HashMap<String, String>>,
    ) -> Result<SshCommandOutput, SshError> {
        if self.has_failed() {
            return Err(SshError::PermanentlyFailed {
                attempts: self.reconnect_attempts(),
            });
        }
        self.touch();

        let mut guard = self.handle.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_handle().await?);
        }
        let Some(handle) = guard.as_ref() else {
            return Err(SshError::Transport("connection handle unavailable".into()));
        };

        self.ensure_shell_detected(handle).await;

        match self.run_remote(handle, command, env).await {
            Ok(output) => {
                self.touch();
                Ok(output)
            }
            Err(err @ SshError::Transport(_)) => {
                *guard = None;
                drop(guard);
                self.schedule_reconnect();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Open a raw session channel (SFTP subsystem negotiation happens on
    /// top of it), lazily connecting like `execute`.
    pub(crate) async fn open_channel(
        self: &Arc<Self>,
    ) -> Result<russh::Channel<client::Msg>, SshError> {
        if self.has_failed() {
            return Err(SshError::PermanentlyFailed {
                attempts: self.reconnect_attempts(),
            });
        }
        self.touch();

        let mut guard = self.handle.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_handle().await?);
        }
        let Some(handle) = guard.as_ref() else {
            return Err(SshError::Transport("connection handle unavailable".into()));
        };

        match handle.channel_open_session().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                *guard = None;
                drop(guard);
                self.schedule_reconnect();
                Err(err.into())
            }
        }
    }

    /// Start the backoff reconnect loop unless one is already running.
    pub fn schedule_reconnect(self: &Arc<Self>) {
        if self.has_failed() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut schedule = ReconnectSchedule::new();
            loop {
                if conn.shutdown.is_cancelled() {
                    break;
                }
                // Idle connections drop quietly instead of reconnecting.
                if conn.idle_for() > IDLE_CUTOFF {
                    debug!(connection = %conn.id, "idle, not reconnecting");
                    break;
                }
                let Some(delay) = schedule.next_delay() else {
                    conn.failed.store(true, Ordering::SeqCst);
                    warn!(connection = %conn.id, attempts = schedule.attempts(), "permanently failed");
                    let _ = conn.failure_tx.send(conn.id.clone());
                    break;
                };
                conn.reconnect_attempts
                    .store(schedule.attempts(), Ordering::SeqCst);
                debug!(connection = %conn.id, attempt = schedule.attempts(), delay_ms = delay.as_millis() as u64, "reconnect backoff");

                tokio::select! {
                    _ = conn.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                match conn.open_handle().await {
                    Ok(handle) => {
                        *conn.handle.lock().await = Some(handle);
                        schedule.reset();
                        conn.reconnect_attempts.store(0, Ordering::SeqCst);
                        info!(connection = %conn.id, "reconnected");
                        break;
                    }
                    Err(err) => {
                        debug!(connection = %conn.id, error = %err, "reconnect attempt failed");
                    }
                }
            }
            conn.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Drop the transport without marking the connection failed.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }

    /// Terminal close: disconnect and stop any reconnect loop.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.disconnect().await;
    }
}
