//! The MCP tool catalog.
//!
//! Every tool funnels through the validation pipeline before touching the
//! operating system. Business failures never become protocol errors: they
//! render as `isError` tool results carrying `_meta.exitCode` (-2 for
//! policy rejections, -1 for execution failures) and a structured envelope
//! with the taxonomy code, remediation, and the diagnostic tool to try.

pub mod diagnostics;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, Meta, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ConfigError, ConfigStore, ServerConfig, ShellProfile, SshConnectionConfig};
use crate::exec::history::{CommandHistory, HistoryEntry};
use crate::exec::jobs::{DEFAULT_MAX_JOBS, JobError, JobRegistry};
use crate::exec::{ExecError, Executor};
use crate::security::{PolicyEngine, PolicyError};
use crate::ssh::known_hosts::default_store_path;
use crate::ssh::{ConnectionPool, DetectedShell, KnownHostsStore, SshError, sftp};

#[derive(Debug, Error)]
pub enum ServerInitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot compile security policy: {0}")]
    Policy(#[from] regex::Error),

    #[error("cannot open known-hosts store: {0}")]
    KnownHosts(#[from] SshError),
}

/// A tool-level failure, rendered as a structured error result.
enum ToolFailure {
    Policy(PolicyError),
    Exec(ExecError),
    Ssh(SshError),
    Job(JobError),
    Config(ConfigError),
}

impl ToolFailure {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Policy(_) => -2,
            Self::Ssh(err) if err.is_validation() => -2,
            _ => -1,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Policy(err) => err.code().as_str(),
            Self::Exec(err) => err.code().as_str(),
            Self::Ssh(err) => err.code().as_str(),
            Self::Job(_) => crate::security::ErrorCode::SpawnFailure.as_str(),
            Self::Config(_) => crate::security::ErrorCode::SpawnFailure.as_str(),
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Policy(err) => err.to_string(),
            Self::Exec(err) => err.to_string(),
            Self::Ssh(err) => err.to_string(),
            Self::Job(err) => err.to_string(),
            Self::Config(err) => crate::sanitize::sanitize_message(&err.to_string()),
        }
    }

    fn guidance(&self) -> String {
        match self {
            Self::Policy(err) => err.user_guidance().to_string(),
            Self::Exec(ExecError::Timeout(_)) => {
                "Raise the per-call timeout or run the command as a background job".to_string()
            }
            Self::Exec(_) => "Check that the shell profile's command exists and is runnable".to_string(),
            Self::Ssh(err) if err.is_validation() => {
                "Adjust the path or host-key state, then retry".to_string()
            }
            Self::Ssh(_) => "Verify the remote host is reachable and credentials are valid".to_string(),
            Self::Job(_) => "Use list_jobs to inspect the registry state".to_string(),
            Self::Config(_) => "Run validate_config to inspect the configuration".to_string(),
        }
    }

    fn diagnostic_tool(&self) -> &'static str {
        match self {
            Self::Policy(err) => err.diagnostic_tool(),
            Self::Exec(_) | Self::Job(_) => "explain_exit_code",
            Self::Ssh(_) => "validate_config",
            Self::Config(_) => "validate_config",
        }
    }
}

fn set_meta(result: &mut CallToolResult, exit_code: i32, structured: Option<serde_json::Value>) {
    let mut map = serde_json::Map::new();
    map.insert("exitCode".to_string(), json!(exit_code));
    if let Some(structured) = structured {
        map.insert("structured".to_string(), structured);
    }
    if let Ok(meta) = serde_json::from_value::<Meta>(serde_json::Value::Object(map)) {
        result.meta = Some(meta);
    }
}

fn success_result(text: impl Into<String>, exit_code: i32) -> CallToolResult {
    let mut result = CallToolResult::success(vec![Content::text(text.into())]);
    set_meta(&mut result, exit_code, None);
    result
}

fn failure_result(failure: &ToolFailure, diagnostic_args: serde_json::Value) -> CallToolResult {
    let message = failure.message();
    let structured = json!({
        "error": message,
        "code": failure.code(),
        "details": message,
        "user_guidance": failure.guidance(),
        "diagnostic_tool": failure.diagnostic_tool(),
        "diagnostic_args": diagnostic_args,
    });
    let text = format!(
        "{message}\n\n{guidance}\nDiagnostic: {tool}",
        guidance = failure.guidance(),
        tool = failure.diagnostic_tool(),
    );
    let mut result = CallToolResult::error(vec![Content::text(text)]);
    set_meta(&mut result, failure.exit_code(), Some(structured));
    result
}

/// Validation profile applied to SSH commands: the detected remote shell,
/// with `unknown` collapsing to the most restrictive rules (PowerShell
/// screening plus the full operator set).
fn ssh_validation_profile(detected: DetectedShell) -> (&'static str, ShellProfile) {
    let name = match detected {
        DetectedShell::Bash => "bash",
        DetectedShell::Sh => "sh",
        DetectedShell::Cmd => "cmd",
        DetectedShell::PowerShell | DetectedShell::Unknown => "powershell",
    };
    (
        name,
        ShellProfile {
            enabled: true,
            command: name.to_string(),
            args: Vec::new(),
            blocked_operators: ["&", "|", ";", "`"].iter().map(|s| s.to_string()).collect(),
            default_env: None,
        },
    )
}

// ── Tool inputs ──────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct ExecuteCommandInput {
    /// Shell profile name, e.g. "bash" or "powershell"
    pub shell: String,
    /// The command line to execute
    pub command: String,
    /// Absolute working directory; defaults to the first allowed path
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Per-call timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Extra environment variables for this call
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct ValidateCommandInput {
    pub shell: String,
    pub command: String,
    #[serde(default)]
    pub working_dir: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct HistoryInput {
    /// Maximum entries to return (most recent first)
    #[serde(default)]
    pub limit: Option<usize>,
    /// Entries to skip from the newest end
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct JobIdInput {
    pub job_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct JobOutputInput {
    pub job_id: String,
    /// Byte offset into the job's output stream; pass the previous
    /// totalSize to receive only new bytes
    #[serde(default)]
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct SshExecuteInput {
    pub connection_id: String,
    pub command: String,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct ConnectionIdInput {
    pub connection_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct SshConnectionInput {
    pub connection_id: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    /// Per-connection override of strictHostKeyChecking
    #[serde(default)]
    pub strict_host_key_checking: Option<bool>,
}

impl SshConnectionInput {
    fn into_parts(self) -> (String, SshConnectionConfig) {
        (
            self.connection_id,
            SshConnectionConfig {
                host: self.host,
                port: self.port.unwrap_or(22),
                username: self.username,
                password: self.password,
                private_key_path: self.private_key_path.map(PathBuf::from),
                strict_host_key_checking: self.strict_host_key_checking,
            },
        )
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct RemoveKnownHostInput {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct SftpTransferInput {
    pub connection_id: String,
    /// Local absolute path (drive letter, UNC, WSL, or Unix form)
    pub local_path: String,
    /// Remote absolute path
    pub remote_path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct SftpListInput {
    pub connection_id: String,
    pub remote_path: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct SftpDeleteInput {
    pub connection_id: String,
    pub remote_path: String,
    /// Must be true to delete a directory
    #[serde(default)]
    pub is_directory: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct ExplainExitCodeInput {
    pub code: i32,
}

// ── Server ───────────────────────────────────────────────────

#[derive(Clone)]
pub struct GatewayServer {
    config: Arc<ServerConfig>,
    config_store: Arc<ConfigStore>,
    policy: Arc<PolicyEngine>,
    executor: Arc<Executor>,
    history: CommandHistory,
    jobs: JobRegistry,
    pool: Arc<ConnectionPool>,
    known_hosts: Arc<KnownHostsStore>,
    shutdown: CancellationToken,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl GatewayServer {
    pub fn new(config_store: ConfigStore) -> Result<Self, ServerInitError> {
        let config = config_store.load()?;
        let policy = PolicyEngine::from_settings(&config.security)?;

        let known_hosts_path = config
            .ssh
            .known_hosts_path
            .clone()
            .unwrap_or_else(default_store_path);
        let known_hosts = Arc::new(KnownHostsStore::open(known_hosts_path)?);

        let shutdown = CancellationToken::new();
        let pool = ConnectionPool::new(
            config.ssh.clone(),
            Arc::clone(&known_hosts),
            shutdown.child_token(),
        );

        let history = CommandHistory::new(config.security.max_history_size);
        history.spawn_cleanup(shutdown.child_token());

        let jobs = JobRegistry::new(DEFAULT_MAX_JOBS);
        jobs.spawn_sweeper(shutdown.child_token());

        let executor = Arc::new(Executor::new(Duration::from_secs(
            config.security.command_timeout,
        )));

        Ok(Self {
            config: Arc::new(config),
            config_store: Arc::new(config_store),
            policy: Arc::new(policy),
            executor,
            history,
            jobs,
            pool,
            known_hosts,
            shutdown,
            tool_router: Self::tool_router(),
        })
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.close_all().await;
    }

    fn profile(&self, shell: &str) -> Result<ShellProfile, ToolFailure> {
        match self.config.shells.get(shell) {
            None => Err(ToolFailure::Policy(PolicyError::UnknownShell {
                name: shell.to_string(),
            })),
            Some(profile) if !profile.enabled => {
                Err(ToolFailure::Policy(PolicyError::ShellNotEnabled {
                    name: shell.to_string(),
                }))
            }
            Some(profile) => Ok(profile.clone()),
        }
    }

    fn default_working_dir(&self) -> Result<PathBuf, ToolFailure> {
        if self.policy.restricts_working_directory() {
            match self.policy.allowed_paths().first() {
                Some(first) => Ok(first.clone()),
                None => Err(ToolFailure::Policy(PolicyError::WorkingDirNotAllowed)),
            }
        } else {
            Ok(std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
        }
    }

    fn fresh_config(&self) -> Result<ServerConfig, ToolFailure> {
        self.config_store.load().map_err(ToolFailure::Config)
    }

    async fn checkout_connection(
        &self,
        connection_id: &str,
    ) -> Result<Arc<crate::ssh::SshConnection>, ToolFailure> {
        let config = self.fresh_config()?;
        let Some(connection_config) = config.ssh.connections.get(connection_id) else {
            return Err(ToolFailure::Ssh(SshError::UnknownConnection(
                connection_id.to_string(),
            )));
        };
        self.pool
            .get(connection_id, connection_config)
            .await
            .map_err(ToolFailure::Ssh)
    }

    async fn run_validated_command(
        &self,
        input: &ExecuteCommandInput,
    ) -> Result<crate::exec::ExecOutcome, ToolFailure> {
        let profile = self.profile(&input.shell)?;
        let validated = self
            .policy
            .validate(
                &input.shell,
                &profile,
                &input.command,
                input.working_dir.as_deref(),
                input.env.as_ref(),
            )
            .map_err(ToolFailure::Policy)?;

        let working_dir = match validated.working_dir {
            Some(dir) => dir,
            None => self.default_working_dir()?,
        };
        let env = self
            .policy
            .env_policy()
            .merged(profile.default_env.as_ref(), validated.env.as_ref());
        let timeout = input.timeout.map(Duration::from_secs);

        if self.config.security.log_commands {
            info!(shell = %input.shell, command = %input.command, "executing command");
        }

        self.executor
            .run(&profile, &input.command, &working_dir, env, timeout)
            .await
            .map_err(ToolFailure::Exec)
    }

    // ── Synchronous execution ────────────────────────────────

    #[tool(
        description = "Execute a command through the configured shell after full security validation. Returns stdout/stderr and the exit code."
    )]
    async fn execute_command(
        &self,
        Parameters(input): Parameters<ExecuteCommandInput>,
    ) -> Result<CallToolResult, McpError> {
        match self.run_validated_command(&input).await {
            Ok(outcome) => {
                self.history
                    .record(HistoryEntry::new(
                        &input.command,
                        &outcome.stdout,
                        outcome.exit_code,
                    ))
                    .await;
                Ok(success_result(outcome.format_human(), outcome.exit_code))
            }
            Err(failure) => {
                self.history
                    .record(HistoryEntry::new(
                        &input.command,
                        failure.message(),
                        failure.exit_code(),
                    ))
                    .await;
                Ok(failure_result(
                    &failure,
                    json!({ "shell": input.shell, "command": input.command }),
                ))
            }
        }
    }

    #[tool(
        description = "Dry-run the validation pipeline for a command without executing anything. Reports which stage rejects it."
    )]
    async fn validate_command(
        &self,
        Parameters(input): Parameters<ValidateCommandInput>,
    ) -> Result<CallToolResult, McpError> {
        let verdict = self.profile(&input.shell).and_then(|profile| {
            self.policy
                .validate(
                    &input.shell,
                    &profile,
                    &input.command,
                    input.working_dir.as_deref(),
                    None,
                )
                .map_err(ToolFailure::Policy)
        });

        let report = match &verdict {
            Ok(_) => json!({
                "valid": true,
                "shell": input.shell,
                "command": input.command,
            }),
            Err(failure) => json!({
                "valid": false,
                "reason": failure.message(),
                "code": failure.code(),
                "next_steps": {
                    "recommended_tool": failure.diagnostic_tool(),
                    "user_guidance": failure.guidance(),
                },
            }),
        };

        let mut result = CallToolResult::success(vec![Content::text(
            serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string()),
        )]);
        set_meta(
            &mut result,
            if verdict.is_ok() { 0 } else { -2 },
            Some(report),
        );
        Ok(result)
    }

    // ── History ──────────────────────────────────────────────

    #[tool(description = "Return recent command history, most recent first.")]
    async fn get_command_history(
        &self,
        Parameters(input): Parameters<HistoryInput>,
    ) -> Result<CallToolResult, McpError> {
        let limit = input.limit.unwrap_or(10).min(self.history.capacity().max(1));
        let entries = self.history.recent(limit, input.offset.unwrap_or(0)).await;
        let rendered = serde_json::to_string_pretty(&entries)
            .unwrap_or_else(|_| "[]".to_string());
        Ok(success_result(rendered, 0))
    }

    #[tool(description = "Clear the command history ring.")]
    async fn clear_command_history(&self) -> Result<CallToolResult, McpError> {
        let removed = self.history.clear().await;
        Ok(success_result(
            format!("Cleared {removed} history entries"),
            0,
        ))
    }

    // ── Background jobs ──────────────────────────────────────

    #[tool(
        description = "Start a command as a background job after full validation. Returns a job id; poll get_job_output to stream its output."
    )]
    async fn start_background_job(
        &self,
        Parameters(input): Parameters<ExecuteCommandInput>,
    ) -> Result<CallToolResult, McpError> {
        let started = async {
            let profile = self.profile(&input.shell)?;
            let validated = self
                .policy
                .validate(
                    &input.shell,
                    &profile,
                    &input.command,
                    input.working_dir.as_deref(),
                    input.env.as_ref(),
                )
                .map_err(ToolFailure::Policy)?;
            let working_dir = match validated.working_dir {
                Some(dir) => dir,
                None => self.default_working_dir()?,
            };
            let env = self
                .policy
                .env_policy()
                .merged(profile.default_env.as_ref(), validated.env.as_ref());
            let timeout = Duration::from_secs(
                input.timeout.unwrap_or(self.config.security.command_timeout),
            );
            self.jobs
                .start(&input.shell, &profile, &input.command, working_dir, env, timeout)
                .await
                .map_err(ToolFailure::Job)
        }
        .await;

        match started {
            Ok(job_id) => Ok(success_result(
                format!("Background job started: {job_id}\nPoll get_job_output with this id."),
                0,
            )),
            Err(failure) => Ok(failure_result(
                &failure,
                json!({ "shell": input.shell, "command": input.command }),
            )),
        }
    }

    #[tool(
        description = "Read a background job's output from a byte offset. Returns totalSize to pass as the next offset, and complete=true once the job has finished."
    )]
    async fn get_job_output(
        &self,
        Parameters(input): Parameters<JobOutputInput>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .jobs
            .output(&input.job_id, input.offset.unwrap_or(0))
            .await
        {
            Ok(output) => {
                let report = json!({
                    "output": output.output,
                    "totalSize": output.total_size,
                    "complete": output.complete,
                });
                let mut result = CallToolResult::success(vec![Content::text(
                    serde_json::to_string(&report).unwrap_or_else(|_| report.to_string()),
                )]);
                set_meta(&mut result, 0, Some(report));
                Ok(result)
            }
            Err(err) => Ok(failure_result(&ToolFailure::Job(err), json!({}))),
        }
    }

    #[tool(description = "List background jobs and their statuses.")]
    async fn list_jobs(&self) -> Result<CallToolResult, McpError> {
        let jobs = self.jobs.list().await;
        let rendered =
            serde_json::to_string_pretty(&jobs).unwrap_or_else(|_| "[]".to_string());
        Ok(success_result(rendered, 0))
    }

    #[tool(description = "Send the terminate signal to a running background job.")]
    async fn terminate_job(
        &self,
        Parameters(input): Parameters<JobIdInput>,
    ) -> Result<CallToolResult, McpError> {
        match self.jobs.terminate(&input.job_id).await {
            Ok(()) => Ok(success_result(
                format!("Terminate signal sent to {}", input.job_id),
                0,
            )),
            Err(err) => Ok(failure_result(&ToolFailure::Job(err), json!({}))),
        }
    }

    #[tool(description = "Delete a finished background job from the registry.")]
    async fn delete_job(
        &self,
        Parameters(input): Parameters<JobIdInput>,
    ) -> Result<CallToolResult, McpError> {
        match self.jobs.delete(&input.job_id).await {
            Ok(record) => Ok(success_result(
                format!("Deleted job {} ({:?})", record.id, record.status),
                0,
            )),
            Err(err) => Ok(failure_result(&ToolFailure::Job(err), json!({}))),
        }
    }

    // ── SSH ──────────────────────────────────────────────────

    #[tool(
        description = "Execute a command on a configured SSH connection. The command passes the same validation pipeline, under the remote shell's rules (most restrictive when the shell is unknown)."
    )]
    async fn ssh_execute(
        &self,
        Parameters(input): Parameters<SshExecuteInput>,
    ) -> Result<CallToolResult, McpError> {
        let executed = async {
            let connection = self.checkout_connection(&input.connection_id).await?;
            let (shell_name, pseudo_profile) =
                ssh_validation_profile(connection.detected_shell().await);
            let validated = self
                .policy
                .validate(shell_name, &pseudo_profile, &input.command, None, input.env.as_ref())
                .map_err(ToolFailure::Policy)?;
            connection
                .execute(&input.command, validated.env.as_ref())
                .await
                .map_err(ToolFailure::Ssh)
        }
        .await;

        match executed {
            Ok(output) => {
                self.history
                    .record(
                        HistoryEntry::new(&input.command, &output.output, output.exit_code)
                            .with_connection(&input.connection_id),
                    )
                    .await;
                let text = if output.output.trim().is_empty() && output.exit_code == 0 {
                    "Command completed successfully (no output)".to_string()
                } else if output.exit_code == 0 {
                    output.output.clone()
                } else {
                    format!(
                        "Command exited with code {}\n\n{}",
                        output.exit_code, output.output
                    )
                };
                Ok(success_result(text, output.exit_code))
            }
            Err(failure) => {
                self.history
                    .record(
                        HistoryEntry::new(&input.command, failure.message(), failure.exit_code())
                            .with_connection(&input.connection_id),
                    )
                    .await;
                Ok(failure_result(
                    &failure,
                    json!({ "connection_id": input.connection_id }),
                ))
            }
        }
    }

    #[tool(description = "Disconnect and remove a pooled SSH connection.")]
    async fn ssh_disconnect(
        &self,
        Parameters(input): Parameters<ConnectionIdInput>,
    ) -> Result<CallToolResult, McpError> {
        if self.pool.disconnect(&input.connection_id).await {
            Ok(success_result(
                format!("Disconnected '{}'", input.connection_id),
                0,
            ))
        } else {
            Ok(success_result(
                format!("No pooled connection '{}'", input.connection_id),
                0,
            ))
        }
    }

    #[tool(description = "Add an SSH connection to the server config (persisted atomically under the config lock).")]
    async fn create_ssh_connection(
        &self,
        Parameters(input): Parameters<SshConnectionInput>,
    ) -> Result<CallToolResult, McpError> {
        let (id, connection) = input.into_parts();
        match self.config_store.create_connection(id.clone(), connection).await {
            Ok(_) => Ok(success_result(format!("Created SSH connection '{id}'"), 0)),
            Err(err) => Ok(failure_result(&ToolFailure::Config(err), json!({}))),
        }
    }

    #[tool(description = "Update an existing SSH connection in the server config.")]
    async fn update_ssh_connection(
        &self,
        Parameters(input): Parameters<SshConnectionInput>,
    ) -> Result<CallToolResult, McpError> {
        let (id, connection) = input.into_parts();
        match self.config_store.update_connection(id.clone(), connection).await {
            Ok(_) => {
                // A live pooled connection keeps its old config; drop it so
                // the next call picks up the update.
                self.pool.remove(&id).await;
                Ok(success_result(format!("Updated SSH connection '{id}'"), 0))
            }
            Err(err) => Ok(failure_result(&ToolFailure::Config(err), json!({}))),
        }
    }

    #[tool(description = "Delete an SSH connection from the server config.")]
    async fn delete_ssh_connection(
        &self,
        Parameters(input): Parameters<ConnectionIdInput>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .config_store
            .delete_connection(input.connection_id.clone())
            .await
        {
            Ok(_) => {
                self.pool.remove(&input.connection_id).await;
                Ok(success_result(
                    format!("Deleted SSH connection '{}'", input.connection_id),
                    0,
                ))
            }
            Err(err) => Ok(failure_result(&ToolFailure::Config(err), json!({}))),
        }
    }

    #[tool(
        description = "Remove a pinned host key so the next connection performs a fresh trust-on-first-use."
    )]
    async fn remove_known_host(
        &self,
        Parameters(input): Parameters<RemoveKnownHostInput>,
    ) -> Result<CallToolResult, McpError> {
        let port = input.port.unwrap_or(22);
        match self.known_hosts.remove(&input.host, port).await {
            Ok(true) => Ok(success_result(
                format!("Removed pinned key for {}:{port}", input.host),
                0,
            )),
            Ok(false) => Ok(success_result(
                format!("No pinned key for {}:{port}", input.host),
                0,
            )),
            Err(err) => Ok(failure_result(&ToolFailure::Ssh(err), json!({}))),
        }
    }

    // ── SFTP ─────────────────────────────────────────────────

    #[tool(description = "Upload a local file to a remote path over SFTP.")]
    async fn sftp_upload(
        &self,
        Parameters(input): Parameters<SftpTransferInput>,
    ) -> Result<CallToolResult, McpError> {
        let uploaded = async {
            let connection = self.checkout_connection(&input.connection_id).await?;
            sftp::upload(
                &connection,
                &input.local_path,
                &input.remote_path,
                self.policy.allowed_paths(),
            )
            .await
            .map_err(ToolFailure::Ssh)
        }
        .await;

        match uploaded {
            Ok(bytes) => Ok(success_result(format!("Uploaded {bytes} bytes"), 0)),
            Err(failure) => Ok(failure_result(
                &failure,
                json!({ "connection_id": input.connection_id }),
            )),
        }
    }

    #[tool(description = "Download a remote file to a local path over SFTP.")]
    async fn sftp_download(
        &self,
        Parameters(input): Parameters<SftpTransferInput>,
    ) -> Result<CallToolResult, McpError> {
        let downloaded = async {
            let connection = self.checkout_connection(&input.connection_id).await?;
            sftp::download(
                &connection,
                &input.remote_path,
                &input.local_path,
                self.policy.allowed_paths(),
            )
            .await
            .map_err(ToolFailure::Ssh)
        }
        .await;

        match downloaded {
            Ok(bytes) => Ok(success_result(format!("Downloaded {bytes} bytes"), 0)),
            Err(failure) => Ok(failure_result(
                &failure,
                json!({ "connection_id": input.connection_id }),
            )),
        }
    }

    #[tool(description = "List a remote directory over SFTP.")]
    async fn sftp_list(
        &self,
        Parameters(input): Parameters<SftpListInput>,
    ) -> Result<CallToolResult, McpError> {
        let listed = async {
            let connection = self.checkout_connection(&input.connection_id).await?;
            sftp::list(&connection, &input.remote_path)
                .await
                .map_err(ToolFailure::Ssh)
        }
        .await;

        match listed {
            Ok(entries) => Ok(success_result(
                serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string()),
                0,
            )),
            Err(failure) => Ok(failure_result(
                &failure,
                json!({ "connection_id": input.connection_id }),
            )),
        }
    }

    #[tool(
        description = "Delete a remote file, or a directory with is_directory=true. System roots are always refused."
    )]
    async fn sftp_delete(
        &self,
        Parameters(input): Parameters<SftpDeleteInput>,
    ) -> Result<CallToolResult, McpError> {
        let deleted = async {
            let connection = self.checkout_connection(&input.connection_id).await?;
            sftp::delete(
                &connection,
                &input.remote_path,
                input.is_directory.unwrap_or(false),
            )
            .await
            .map_err(ToolFailure::Ssh)
        }
        .await;

        match deleted {
            Ok(()) => Ok(success_result(format!("Deleted {}", input.remote_path), 0)),
            Err(failure) => Ok(failure_result(
                &failure,
                json!({ "connection_id": input.connection_id }),
            )),
        }
    }

    // ── Diagnostics ──────────────────────────────────────────

    #[tool(description = "Show the active security policy: blocklists, limits, allowed paths, shells, SSH settings.")]
    async fn check_security_config(&self) -> Result<CallToolResult, McpError> {
        let config = self
            .fresh_config()
            .unwrap_or_else(|_| (*self.config).clone());
        let summary = diagnostics::security_config_summary(&config);
        Ok(success_result(
            serde_json::to_string_pretty(&summary).unwrap_or_else(|_| summary.to_string()),
            0,
        ))
    }

    #[tool(description = "Validate the server configuration and report findings.")]
    async fn validate_config(&self) -> Result<CallToolResult, McpError> {
        match self.fresh_config() {
            Ok(config) => {
                let findings = diagnostics::config_findings(&config);
                let text = if findings.is_empty() {
                    "Configuration is valid; no findings.".to_string()
                } else {
                    format!(
                        "Configuration loaded with {} finding(s):\n- {}",
                        findings.len(),
                        findings.join("\n- ")
                    )
                };
                Ok(success_result(text, 0))
            }
            Err(failure) => Ok(failure_result(&failure, json!({}))),
        }
    }

    #[tool(description = "Explain what a gateway exit code means (0, positive, -1, -2).")]
    async fn explain_exit_code(
        &self,
        Parameters(input): Parameters<ExplainExitCodeInput>,
    ) -> Result<CallToolResult, McpError> {
        Ok(success_result(diagnostics::explain_exit_code(input.code), 0))
    }

    #[tool(description = "List processes on the host. This operation is refused by policy.")]
    async fn list_processes(&self) -> Result<CallToolResult, McpError> {
        let mut result = CallToolResult::error(vec![Content::text(
            "Process listing is refused by policy in this server. The enableProcessListing \
             config flag is reserved; setting it does not enable the operation.",
        )]);
        set_meta(&mut result, -2, None);
        Ok(result)
    }
}

#[tool_handler]
impl ServerHandler for GatewayServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "A policy-enforcing shell execution gateway. Commands pass a fail-fast \
                 validation pipeline (Unicode screening, operator and command blocklists, \
                 path containment, environment hygiene) before anything is spawned. \
                 Execute locally with execute_command or start_background_job, remotely \
                 over pooled SSH with ssh_execute, and transfer files with the sftp_* \
                 tools. When a call is rejected, the result names the rejection code and \
                 the diagnostic tool to run next."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn server_in(dir: &std::path::Path) -> GatewayServer {
        let store = ConfigStore::new(dir.join("config.json"));
        // Point the known-hosts store into the temp dir via a config file.
        let mut config = ServerConfig::default();
        config.ssh.known_hosts_path = Some(dir.join("known_hosts.json"));
        config.security.allowed_paths = vec![dir.to_string_lossy().into_owned()];
        // Permissive operator list for the shell under test, so background
        // jobs can emit staged output; the redirection set stays screened.
        if let Some(profile) = config.shells.get_mut("bash") {
            profile.blocked_operators = Vec::new();
        }
        std::fs::write(
            dir.join("config.json"),
            serde_json::to_vec_pretty(&config).unwrap(),
        )
        .unwrap();
        GatewayServer::new(store).unwrap()
    }

    fn as_value(result: &CallToolResult) -> serde_json::Value {
        serde_json::to_value(result).expect("tool result serializes")
    }

    fn result_text(result: &CallToolResult) -> String {
        as_value(result)["content"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|c| c["text"].as_str().map(str::to_string))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }

    fn meta_value(result: &CallToolResult, key: &str) -> serde_json::Value {
        as_value(result)["_meta"][key].clone()
    }

    fn meta_exit_code(result: &CallToolResult) -> i64 {
        meta_value(result, "exitCode")
            .as_i64()
            .expect("exitCode in _meta")
    }

    #[tokio::test]
    async fn test_execute_command_success_records_history() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());

        let result = server
            .execute_command(Parameters(ExecuteCommandInput {
                shell: "bash".into(),
                command: "echo gateway".into(),
                working_dir: None,
                timeout: None,
                env: None,
            }))
            .await
            .unwrap();

        assert_ne!(result.is_error, Some(true));
        assert_eq!(meta_exit_code(&result), 0);
        assert!(result_text(&result).contains("gateway"));

        let history = server.history.recent(10, 0).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].exit_code, 0);
    }

    #[tokio::test]
    async fn test_homoglyph_rejection_envelope() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());

        let result = server
            .execute_command(Parameters(ExecuteCommandInput {
                shell: "bash".into(),
                command: "dir \u{FF5C} del".into(),
                working_dir: None,
                timeout: None,
                env: None,
            }))
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(true));
        assert_eq!(meta_exit_code(&result), -2);
        assert!(result_text(&result).contains("Unicode variant of blocked operator: |"));

        let structured = meta_value(&result, "structured");
        assert_eq!(structured["code"], "SEC002");
        assert!(!structured["user_guidance"].as_str().unwrap().is_empty());

        // Rejections land in history too, with the -2 sentinel.
        let history = server.history.recent(10, 0).await;
        assert_eq!(history[0].exit_code, -2);
    }

    #[tokio::test]
    async fn test_validate_command_blocked_with_extension() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());

        let result = server
            .validate_command(Parameters(ValidateCommandInput {
                shell: "bash".into(),
                command: r"C:\tools\RM.EXE -rf /".into(),
                working_dir: None,
            }))
            .await
            .unwrap();

        let structured = meta_value(&result, "structured");
        assert_eq!(structured["valid"], false);
        let reason = structured["reason"].as_str().unwrap().to_lowercase();
        assert!(reason.contains("command 'rm' is blocked"), "reason: {reason}");
        assert_eq!(
            structured["next_steps"]["recommended_tool"],
            "check_security_config"
        );
    }

    #[tokio::test]
    async fn test_validate_command_accepts_clean() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());

        let result = server
            .validate_command(Parameters(ValidateCommandInput {
                shell: "bash".into(),
                command: "echo ok".into(),
                working_dir: None,
            }))
            .await
            .unwrap();
        assert_eq!(meta_exit_code(&result), 0);
    }

    #[tokio::test]
    async fn test_unknown_shell_rejected() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());

        let result = server
            .execute_command(Parameters(ExecuteCommandInput {
                shell: "fish".into(),
                command: "echo hi".into(),
                working_dir: None,
                timeout: None,
                env: None,
            }))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(meta_exit_code(&result), -2);
    }

    #[tokio::test]
    async fn test_job_lifecycle_via_tools() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());

        let started = server
            .start_background_job(Parameters(ExecuteCommandInput {
                shell: "bash".into(),
                command: "printf chunk1; sleep 0.2; printf chunk2".into(),
                working_dir: None,
                timeout: Some(30),
                env: None,
            }))
            .await
            .unwrap();
        let text = result_text(&started);
        let job_id = text
            .split_whitespace()
            .find(|w| w.starts_with("job_"))
            .unwrap()
            .to_string();

        let mut complete = false;
        let mut total = 0usize;
        let mut collected = String::new();
        for _ in 0..100 {
            let polled = server
                .get_job_output(Parameters(JobOutputInput {
                    job_id: job_id.clone(),
                    offset: Some(total),
                }))
                .await
                .unwrap();
            let structured = meta_value(&polled, "structured");
            collected.push_str(structured["output"].as_str().unwrap());
            total = structured["totalSize"].as_u64().unwrap() as usize;
            complete = structured["complete"].as_bool().unwrap();
            if complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(complete);
        assert!(collected.contains("chunk1"));
        assert!(collected.contains("chunk2"));
        // Non-overlapping increments: each chunk appears exactly once.
        assert_eq!(collected.matches("chunk1").count(), 1);
    }

    #[tokio::test]
    async fn test_ssh_execute_unknown_connection() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());

        let result = server
            .ssh_execute(Parameters(SshExecuteInput {
                connection_id: "ghost".into(),
                command: "echo hi".into(),
                env: None,
            }))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(meta_exit_code(&result), -1);
    }

    #[tokio::test]
    async fn test_ssh_connection_crud_tools() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());

        let created = server
            .create_ssh_connection(Parameters(SshConnectionInput {
                connection_id: "build".into(),
                host: "10.1.1.1".into(),
                port: None,
                username: "ci".into(),
                password: Some("pw".into()),
                private_key_path: None,
                strict_host_key_checking: None,
            }))
            .await
            .unwrap();
        assert_ne!(created.is_error, Some(true));

        let config = server.config_store.load().unwrap();
        assert_eq!(config.ssh.connections["build"].port, 22);

        let deleted = server
            .delete_ssh_connection(Parameters(ConnectionIdInput {
                connection_id: "build".into(),
            }))
            .await
            .unwrap();
        assert_ne!(deleted.is_error, Some(true));
        assert!(server.config_store.load().unwrap().ssh.connections.is_empty());
    }

    #[tokio::test]
    async fn test_list_processes_refuses() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());
        let result = server.list_processes().await.unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(meta_exit_code(&result), -2);
        assert!(result_text(&result).contains("enableProcessListing"));
    }

    #[tokio::test]
    async fn test_explain_exit_code_tool() {
        let dir = tempdir().unwrap();
        let server = server_in(dir.path());
        let result = server
            .explain_exit_code(Parameters(ExplainExitCodeInput { code: -2 }))
            .await
            .unwrap();
        assert!(result_text(&result).contains("validation"));
    }
}
