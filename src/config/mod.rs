//! Server configuration document.
//!
//! The on-disk form is a single JSON object with camelCase keys, mirroring
//! what `--init-config` writes. Everything carries serde defaults so a
//! partial document (or none at all) yields a working, locked-down server.

mod store;

pub use store::{ConfigStore, write_default_config};

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::env::{DEFAULT_MAX_VALUE_LEN, DEFAULT_MAX_VARS, EnvPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid blocked argument pattern '{pattern}': {source}")]
    BadArgumentPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("shell '{shell}' has invalid defaultEnv: {reason}")]
    BadDefaultEnv { shell: String, reason: String },

    #[error("config is locked by another process")]
    Locked,

    #[error("ssh connection '{0}' not found")]
    UnknownConnection(String),

    #[error("ssh connection '{0}' already exists")]
    DuplicateConnection(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default = "default_shells")]
    pub shells: HashMap<String, ShellProfile>,
    #[serde(default)]
    pub ssh: SshSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            security: SecuritySettings::default(),
            shells: default_shells(),
            ssh: SshSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySettings {
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,
    /// Seconds before a foreground command is terminated.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    #[serde(default = "default_blocked_commands")]
    pub blocked_commands: Vec<String>,
    #[serde(default = "default_blocked_arguments")]
    pub blocked_arguments: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default = "default_true")]
    pub restrict_working_directory: bool,
    #[serde(default)]
    pub log_commands: bool,
    #[serde(default = "default_max_history_size")]
    pub max_history_size: usize,
    /// Parsed but reserved: process listing stays refused either way.
    #[serde(default)]
    pub enable_process_listing: bool,
    #[serde(default)]
    pub env: EnvSettings,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            max_command_length: default_max_command_length(),
            command_timeout: default_command_timeout(),
            blocked_commands: default_blocked_commands(),
            blocked_arguments: default_blocked_arguments(),
            allowed_paths: Vec::new(),
            restrict_working_directory: true,
            log_commands: false,
            max_history_size: default_max_history_size(),
            enable_process_listing: false,
            env: EnvSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvSettings {
    /// Names rejected by exact or substring match (uppercased). Empty means
    /// the built-in credential/injection blocklist.
    #[serde(default)]
    pub blocked: Vec<String>,
    /// When present, switches the manager to allowlist mode.
    #[serde(default)]
    pub allowlist: Option<Vec<String>>,
    #[serde(default = "default_max_env_vars")]
    pub max_vars: usize,
    #[serde(default = "default_max_env_value_length")]
    pub max_value_length: usize,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            blocked: Vec::new(),
            allowlist: None,
            max_vars: DEFAULT_MAX_VARS,
            max_value_length: DEFAULT_MAX_VALUE_LEN,
        }
    }
}

impl EnvSettings {
    pub fn to_policy(&self) -> EnvPolicy {
        if self.blocked.is_empty() && self.allowlist.is_none() {
            return EnvPolicy::default();
        }
        EnvPolicy::new(
            self.blocked.clone(),
            self.allowlist.clone(),
            self.max_vars,
            self.max_value_length,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellProfile {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_blocked_operators")]
    pub blocked_operators: Vec<String>,
    #[serde(default)]
    pub default_env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub connections: HashMap<String, SshConnectionConfig>,
    /// Defaults to `~/.win-cli-mcp/known_hosts.json`.
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
    /// `true` rejects unknown hosts; `false` pins them on first use (TOFU).
    #[serde(default)]
    pub strict_host_key_checking: bool,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    #[serde(default = "default_keepalive_count_max")]
    pub keepalive_count_max: usize,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            connections: HashMap::new(),
            known_hosts_path: None,
            strict_host_key_checking: false,
            max_pool_size: default_max_pool_size(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_count_max: default_keepalive_count_max(),
            ready_timeout: default_ready_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConnectionConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Per-connection override of the global strict setting.
    #[serde(default)]
    pub strict_host_key_checking: Option<bool>,
}

fn default_true() -> bool {
    true
}

fn default_max_command_length() -> usize {
    2000
}

fn default_command_timeout() -> u64 {
    30
}

fn default_max_history_size() -> usize {
    1000
}

fn default_max_env_vars() -> usize {
    DEFAULT_MAX_VARS
}

fn default_max_env_value_length() -> usize {
    DEFAULT_MAX_VALUE_LEN
}

fn default_max_pool_size() -> usize {
    10
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_count_max() -> usize {
    3
}

fn default_ready_timeout() -> u64 {
    20
}

fn default_ssh_port() -> u16 {
    22
}

fn default_blocked_commands() -> Vec<String> {
    [
        "rm", "del", "rmdir", "format", "diskpart", "shutdown", "restart", "reboot", "reg",
        "regedit", "net", "netsh", "takeown", "icacls", "mkfs", "dd", "chmod", "chown",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_blocked_arguments() -> Vec<String> {
    [
        "--exec",
        "-e",
        "/c",
        "-enc",
        "-encodedcommand",
        "-command",
        "--interactive",
        "-i",
        "--login",
        "--system",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_blocked_operators() -> Vec<String> {
    ["&", "|", ";", "`"].iter().map(|s| s.to_string()).collect()
}

fn default_shells() -> HashMap<String, ShellProfile> {
    let mut shells = HashMap::new();
    #[cfg(windows)]
    {
        shells.insert(
            "powershell".to_string(),
            ShellProfile {
                enabled: true,
                command: "powershell.exe".into(),
                args: vec!["-NoProfile".into(), "-Command".into()],
                blocked_operators: default_blocked_operators(),
                default_env: None,
            },
        );
        shells.insert(
            "cmd".to_string(),
            ShellProfile {
                enabled: true,
                command: "cmd.exe".into(),
                args: vec!["/c".into()],
                blocked_operators: default_blocked_operators(),
                default_env: None,
            },
        );
        shells.insert(
            "gitbash".to_string(),
            ShellProfile {
                enabled: false,
                command: r"C:\Program Files\Git\bin\bash.exe".into(),
                args: vec!["-c".into()],
                blocked_operators: default_blocked_operators(),
                default_env: None,
            },
        );
    }
    #[cfg(not(windows))]
    {
        shells.insert(
            "bash".to_string(),
            ShellProfile {
                enabled: true,
                command: "bash".into(),
                args: vec!["-c".into()],
                blocked_operators: default_blocked_operators(),
                default_env: None,
            },
        );
        shells.insert(
            "sh".to_string(),
            ShellProfile {
                enabled: true,
                command: "sh".into(),
                args: vec!["-c".into()],
                blocked_operators: default_blocked_operators(),
                default_env: None,
            },
        );
        shells.insert(
            "powershell".to_string(),
            ShellProfile {
                enabled: false,
                command: "pwsh".into(),
                args: vec!["-NoProfile".into(), "-Command".into()],
                blocked_operators: default_blocked_operators(),
                default_env: None,
            },
        );
    }
    shells
}

impl ServerConfig {
    /// Load-time validation. Failures here are fatal to startup: a config
    /// that ships a poisoned `defaultEnv` or an uncompilable argument
    /// pattern must never reach the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for pattern in &self.security.blocked_arguments {
            regex::RegexBuilder::new(&format!("^(?:{pattern})$"))
                .case_insensitive(true)
                .build()
                .map_err(|source| ConfigError::BadArgumentPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
        }

        let env_policy = self.security.env.to_policy();
        for (name, profile) in &self.shells {
            if let Some(default_env) = &profile.default_env {
                env_policy.validate_map(default_env).map_err(|err| {
                    ConfigError::BadDefaultEnv {
                        shell: name.clone(),
                        reason: err.to_string(),
                    }
                })?;
            }
        }
        Ok(())
    }

    /// Canonical absolute forms of the allowlist, resolved once at startup.
    pub fn canonical_allowed_paths(&self) -> Vec<PathBuf> {
        self.security
            .allowed_paths
            .iter()
            .map(|p| crate::security::path::canonicalize(&crate::security::path::normalize_input(p)))
            .collect()
    }

    pub fn shell(&self, name: &str) -> Option<&ShellProfile> {
        self.shells.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.security.max_command_length, 2000);
        assert_eq!(config.security.command_timeout, 30);
        assert!(config.security.restrict_working_directory);
        assert_eq!(config.security.max_history_size, 1000);
        assert_eq!(config.ssh.max_pool_size, 10);
        assert!(!config.shells.is_empty());
    }

    #[test]
    fn test_camel_case_keys() {
        let json = r#"{
            "security": {
                "maxCommandLength": 500,
                "blockedCommands": ["rm"],
                "restrictWorkingDirectory": false
            }
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.security.max_command_length, 500);
        assert_eq!(config.security.blocked_commands, vec!["rm"]);
        assert!(!config.security.restrict_working_directory);
    }

    #[test]
    fn test_validate_rejects_bad_argument_pattern() {
        let mut config = ServerConfig::default();
        config.security.blocked_arguments = vec!["(".into()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadArgumentPattern { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_poisoned_default_env() {
        let mut config = ServerConfig::default();
        let profile = config.shells.values_mut().next().unwrap();
        let mut env = HashMap::new();
        env.insert("LD_PRELOAD".to_string(), "/evil.so".to_string());
        profile.default_env = Some(env);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadDefaultEnv { .. })
        ));
    }

    #[test]
    fn test_default_config_validates() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_roundtrip_preserves_ssh_connections() {
        let json = r#"{
            "ssh": {
                "enabled": true,
                "connections": {
                    "build-box": {
                        "host": "10.0.0.5",
                        "username": "ci",
                        "privateKeyPath": "/home/ci/.ssh/id_ed25519"
                    }
                }
            }
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        let conn = &config.ssh.connections["build-box"];
        assert_eq!(conn.port, 22);
        assert_eq!(conn.username, "ci");

        let back = serde_json::to_string(&config).unwrap();
        assert!(back.contains("privateKeyPath"));
    }
}
