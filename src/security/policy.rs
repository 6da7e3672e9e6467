//! The validation pipeline.
//!
//! Ordered, fail-fast stages: operator screen → parse → command blocklist →
//! argument blocklist → length → working directory → environment. The first
//! rejection is terminal and carries its taxonomy code; nothing is spawned
//! unless every stage passes.

use std::collections::HashMap;
use std::path::PathBuf;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use super::env::EnvPolicy;
use super::error::PolicyError;
use super::parser::{self, ParsedCommand};
use super::path;
use super::unicode;
use crate::config::{SecuritySettings, ShellProfile};

/// Redirection operators screened in addition to a profile's own list.
const REDIRECTION_OPERATORS: &[&str] = &[">", "<", ">>", "2>", "2>&1"];

/// Extensions stripped before the command-blocklist comparison.
const STRIPPED_EXTENSIONS: &[&str] = &[
    "exe", "cmd", "bat", "ps1", "vbs", "js", "com", "scr", "msi", "pif", "wsf", "hta",
];

/// A command that survived the pipeline, ready for the executor.
#[derive(Debug, Clone)]
pub struct ValidatedCommand {
    pub parsed: ParsedCommand,
    /// Realpath to run in, when the caller supplied a working directory.
    pub working_dir: Option<PathBuf>,
    /// The caller's environment map, verbatim (already validated).
    pub env: Option<HashMap<String, String>>,
}

pub struct PolicyEngine {
    max_command_length: usize,
    blocked_commands: Vec<String>,
    blocked_arguments: Vec<Regex>,
    allowed_paths: Vec<PathBuf>,
    restrict_working_directory: bool,
    env_policy: EnvPolicy,
}

impl PolicyEngine {
    /// Compile a policy from validated settings. Argument patterns are
    /// anchored (`^pattern$`) and case-insensitive; `ServerConfig::validate`
    /// has already proven they compile, so failures here are impossible in
    /// practice but still propagated.
    pub fn from_settings(settings: &SecuritySettings) -> Result<Self, regex::Error> {
        let blocked_arguments = settings
            .blocked_arguments
            .iter()
            .map(|pattern| {
                RegexBuilder::new(&format!("^(?:{pattern})$"))
                    .case_insensitive(true)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            max_command_length: settings.max_command_length,
            blocked_commands: settings
                .blocked_commands
                .iter()
                .map(|c| c.to_lowercase())
                .collect(),
            blocked_arguments,
            allowed_paths: settings
                .allowed_paths
                .iter()
                .map(|p| path::canonicalize(&path::normalize_input(p)))
                .collect(),
            restrict_working_directory: settings.restrict_working_directory,
            env_policy: settings.env.to_policy(),
        })
    }

    pub fn allowed_paths(&self) -> &[PathBuf] {
        &self.allowed_paths
    }

    pub fn env_policy(&self) -> &EnvPolicy {
        &self.env_policy
    }

    pub fn restricts_working_directory(&self) -> bool {
        self.restrict_working_directory
    }

    /// True when a path (not necessarily a working directory) is inside the
    /// allowlist. Used by the SFTP local-path checks.
    pub fn is_path_allowed(&self, candidate: &str) -> bool {
        path::is_contained(&path::normalize_input(candidate), &self.allowed_paths)
    }

    /// Run the full pipeline for `command` under `profile`.
    pub fn validate(
        &self,
        shell_name: &str,
        profile: &ShellProfile,
        command: &str,
        working_dir: Option<&str>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<ValidatedCommand, PolicyError> {
        // 1. Unicode screen, then operator blocklist (profile operators plus
        //    redirection, deliberately overlapping).
        let powershell = is_powershell(shell_name, profile);
        unicode::screen(command, powershell).map_err(PolicyError::from_threat)?;

        for operator in profile
            .blocked_operators
            .iter()
            .map(String::as_str)
            .chain(REDIRECTION_OPERATORS.iter().copied())
        {
            if !operator.is_empty() && command.contains(operator) {
                return Err(PolicyError::BlockedOperator {
                    operator: operator.to_string(),
                });
            }
        }

        // 2. Parse.
        let parsed = parser::parse(command).map_err(|_| PolicyError::UnclosedQuote)?;

        // 3. Command blocklist on the stripped, lowercased basename.
        let basename = command_basename(&parsed.program);
        if let Some(blocked) = self
            .blocked_commands
            .iter()
            .find(|blocked| **blocked == basename)
        {
            debug!(command = %blocked, "rejected blocked command");
            return Err(PolicyError::BlockedCommand {
                name: blocked.clone(),
            });
        }

        // 4. Argument blocklist.
        for arg in &parsed.args {
            for pattern in &self.blocked_arguments {
                if pattern.is_match(arg) {
                    return Err(PolicyError::BlockedArgument {
                        pattern: pattern.as_str().to_string(),
                    });
                }
            }
        }

        // 5. Length.
        if command.len() > self.max_command_length {
            return Err(PolicyError::CommandTooLong {
                length: command.len(),
                max: self.max_command_length,
            });
        }

        // 6. Working directory → realpath.
        let working_dir = match working_dir {
            Some(dir) => Some(path::validate_working_directory(
                dir,
                &self.allowed_paths,
                self.restrict_working_directory,
            )?),
            None => None,
        };

        // 7. Environment.
        if let Some(env) = env {
            self.env_policy.validate_map(env)?;
        }

        Ok(ValidatedCommand {
            parsed,
            working_dir,
            env: env.cloned(),
        })
    }
}

/// Basename of the program with any known executable extension stripped,
/// lowercased for comparison.
fn command_basename(program: &str) -> String {
    let basename = program
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(program)
        .to_lowercase();
    for ext in STRIPPED_EXTENSIONS {
        if let Some(stem) = basename.strip_suffix(&format!(".{ext}")) {
            return stem.to_string();
        }
    }
    basename
}

fn is_powershell(shell_name: &str, profile: &ShellProfile) -> bool {
    let name = shell_name.to_ascii_lowercase();
    name.contains("powershell")
        || name == "pwsh"
        || profile.command.to_ascii_lowercase().contains("powershell")
        || profile.command.to_ascii_lowercase().contains("pwsh")
}
