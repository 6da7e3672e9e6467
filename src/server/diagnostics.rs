//! Self-service diagnostics: the tools error envelopes point at.

use serde_json::{Value, json};

use crate::config::ServerConfig;

/// Summary of the active security policy, for `check_security_config`.
pub fn security_config_summary(config: &ServerConfig) -> Value {
    let shells: Vec<Value> = {
        let mut names: Vec<_> = config.shells.iter().collect();
        names.sort_by_key(|(name, _)| name.to_string());
        names
            .into_iter()
            .map(|(name, profile)| {
                json!({
                    "name": name,
                    "enabled": profile.enabled,
                    "command": profile.command,
                    "blockedOperators": profile.blocked_operators,
                })
            })
            .collect()
    };

    let mut connection_ids: Vec<_> = config.ssh.connections.keys().cloned().collect();
    connection_ids.sort();

    json!({
        "maxCommandLength": config.security.max_command_length,
        "commandTimeout": config.security.command_timeout,
        "blockedCommands": config.security.blocked_commands,
        "blockedArguments": config.security.blocked_arguments,
        "allowedPaths": config.security.allowed_paths,
        "restrictWorkingDirectory": config.security.restrict_working_directory,
        "logCommands": config.security.log_commands,
        "maxHistorySize": config.security.max_history_size,
        "environment": {
            "mode": if config.security.env.allowlist.is_some() { "allowlist" } else { "blocklist" },
            "maxVars": config.security.env.max_vars,
            "maxValueLength": config.security.env.max_value_length,
        },
        "shells": shells,
        "ssh": {
            "enabled": config.ssh.enabled,
            "connections": connection_ids,
            "strictHostKeyChecking": config.ssh.strict_host_key_checking,
            "maxPoolSize": config.ssh.max_pool_size,
        },
    })
}

/// Non-fatal config findings, for `validate_config`. Load-time validation
/// has already proven the hard invariants; these are the soft ones an
/// operator usually wants flagged.
pub fn config_findings(config: &ServerConfig) -> Vec<String> {
    let mut findings = Vec::new();

    if !config.shells.values().any(|profile| profile.enabled) {
        findings.push("no shell profile is enabled; every execute_command call will fail".into());
    }

    if config.security.allowed_paths.is_empty() && config.security.restrict_working_directory {
        findings.push(
            "restrictWorkingDirectory is on but allowedPaths is empty; no working directory can validate"
                .into(),
        );
    }

    for (name, raw) in config
        .security
        .allowed_paths
        .iter()
        .enumerate()
        .map(|(i, p)| (format!("allowedPaths[{i}]"), p))
    {
        if !crate::security::path::is_absolute_input(raw) {
            findings.push(format!("{name} ('{raw}') is not absolute"));
        } else if !crate::security::path::normalize_input(raw).is_dir() {
            findings.push(format!("{name} does not exist as a directory"));
        }
    }

    for (id, connection) in &config.ssh.connections {
        if connection.host.trim().is_empty() {
            findings.push(format!("ssh connection '{id}' has an empty host"));
        }
        if connection.password.is_none() && connection.private_key_path.is_none() {
            findings.push(format!(
                "ssh connection '{id}' has neither a password nor a private key"
            ));
        }
        if let Some(path) = &connection.private_key_path {
            if !path.exists() {
                findings.push(format!("ssh connection '{id}' names a missing private key file"));
            }
        }
    }

    if config.ssh.enabled && config.ssh.connections.is_empty() {
        findings.push("ssh is enabled but no connections are configured".into());
    }

    findings
}

/// Human explanation of the exit-code sentinels.
pub fn explain_exit_code(code: i32) -> String {
    match code {
        0 => "Exit code 0: the command completed successfully.".to_string(),
        -1 => "Exit code -1: execution failure. The process could not be spawned (EXEC001), \
               timed out (EXEC002), or its output streams failed (EXEC004); for SSH, the \
               transport failed (EXEC005) or an SFTP operation failed (EXEC006). Nothing about \
               this code reflects the command's own logic."
            .to_string(),
        -2 => "Exit code -2: validation failure. The security policy rejected the command \
               before anything was executed (codes SEC001-SEC009). Use validate_command to see \
               which stage rejects it and check_security_config to inspect the active policy."
            .to_string(),
        code if code > 0 => format!(
            "Exit code {code}: the child process ran and exited with status {code}. The \
             gateway executed it normally; consult the command's own documentation for the \
             meaning of this status."
        ),
        code => format!(
            "Exit code {code}: not one of the gateway's sentinels (0, positive, -1, -2). \
             This value came from the child process itself."
        ),
    }
}
