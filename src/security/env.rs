//! Per-call environment validation and merging.
//!
//! Names are matched case-insensitively. In blocklist mode a name is
//! rejected when its uppercased form equals a blocked entry or contains one
//! as a substring, so `MY_API_KEY_STORE` falls to a blocked `API_KEY`.
//! In allowlist mode only listed names pass.

use std::collections::{HashMap, HashSet};

use super::error::PolicyError;

pub const DEFAULT_MAX_VARS: usize = 20;
pub const DEFAULT_MAX_VALUE_LEN: usize = 32_768;

/// Credential-shaped names plus loader/linker injection hazards.
const DEFAULT_BLOCKED: &[&str] = &[
    "PASSWORD",
    "PASSWD",
    "SECRET",
    "TOKEN",
    "API_KEY",
    "APIKEY",
    "ACCESS_KEY",
    "AWS_SECRET_ACCESS_KEY",
    "PRIVATE_KEY",
    "CREDENTIAL",
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
];

#[derive(Debug, Clone)]
pub struct EnvPolicy {
    blocked: Vec<String>,
    allowlist: Option<HashSet<String>>,
    max_vars: usize,
    max_value_len: usize,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            blocked: DEFAULT_BLOCKED.iter().map(|s| s.to_string()).collect(),
            allowlist: None,
            max_vars: DEFAULT_MAX_VARS,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
        }
    }
}

impl EnvPolicy {
    pub fn new(
        blocked: Vec<String>,
        allowlist: Option<Vec<String>>,
        max_vars: usize,
        max_value_len: usize,
    ) -> Self {
        Self {
            blocked: blocked.into_iter().map(|s| s.to_uppercase()).collect(),
            allowlist: allowlist
                .map(|names| names.into_iter().map(|s| s.to_uppercase()).collect()),
            max_vars,
            max_value_len,
        }
    }

    pub fn max_vars(&self) -> usize {
        self.max_vars
    }

    pub fn max_value_len(&self) -> usize {
        self.max_value_len
    }

    pub fn blocked_names(&self) -> &[String] {
        &self.blocked
    }

    pub fn validate_name(&self, name: &str) -> Result<(), PolicyError> {
        let upper = name.to_uppercase();

        if let Some(allowlist) = &self.allowlist {
            if allowlist.contains(&upper) {
                return Ok(());
            }
            return Err(PolicyError::BlockedEnvVar { name: name.to_string() });
        }

        if self
            .blocked
            .iter()
            .any(|blocked| upper == *blocked || upper.contains(blocked.as_str()))
        {
            return Err(PolicyError::BlockedEnvVar { name: name.to_string() });
        }
        Ok(())
    }

    pub fn validate_value(&self, name: &str, value: &str) -> Result<(), PolicyError> {
        if value.contains('\0') {
            return Err(PolicyError::EnvValueRejected {
                name: name.to_string(),
                reason: "value contains a NUL byte".into(),
            });
        }
        if value
            .chars()
            .any(|c| c.is_control() && c != '\t' && c != '\n')
        {
            return Err(PolicyError::EnvValueRejected {
                name: name.to_string(),
                reason: "value contains control characters".into(),
            });
        }
        if value.len() > self.max_value_len {
            return Err(PolicyError::EnvValueRejected {
                name: name.to_string(),
                reason: format!(
                    "value exceeds maximum length of {} bytes",
                    self.max_value_len
                ),
            });
        }
        Ok(())
    }

    /// Validate a full per-call map: count cap first, then every pair.
    pub fn validate_map(&self, map: &HashMap<String, String>) -> Result<(), PolicyError> {
        if map.len() > self.max_vars {
            return Err(PolicyError::EnvCountExceeded {
                count: map.len(),
                max: self.max_vars,
            });
        }
        for (name, value) in map {
            self.validate_name(name)?;
            self.validate_value(name, value)?;
        }
        Ok(())
    }

    /// Build the process environment: system environment, then the shell
    /// profile's defaults, then the caller's map. Later entries win by key.
    /// Both supplied maps must have been validated already.
    pub fn merged(
        &self,
        profile_defaults: Option<&HashMap<String, String>>,
        call_env: Option<&HashMap<String, String>>,
    ) -> HashMap<String, String> {
        let mut merged: HashMap<String, String> = std::env::vars().collect();
        if let Some(defaults) = profile_defaults {
            merged.extend(defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(call) = call_env {
            merged.extend(call.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}
