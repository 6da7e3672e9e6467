//! Policy rejection taxonomy.

use thiserror::Error;

use super::unicode::UnicodeThreat;

/// Stable rejection/failure codes surfaced in structured tool errors.
///
/// `SECxxx` codes are validation rejections (exit code -2 at the tool
/// boundary); `EXECxxx` codes are execution failures (exit code -1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BlockedCommand,
    BlockedOperator,
    MalformedCommand,
    BlockedArgument,
    CommandTooLong,
    PathNotAllowed,
    BlockedEnvironment,
    HostKeyMismatch,
    UnknownHostStrict,
    SpawnFailure,
    Timeout,
    NonzeroExit,
    StreamFailure,
    SshTransportFailure,
    SftpFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockedCommand => "SEC001",
            Self::BlockedOperator => "SEC002",
            Self::MalformedCommand => "SEC003",
            Self::BlockedArgument => "SEC004",
            Self::CommandTooLong => "SEC005",
            Self::PathNotAllowed => "SEC006",
            Self::BlockedEnvironment => "SEC007",
            Self::HostKeyMismatch => "SEC008",
            Self::UnknownHostStrict => "SEC009",
            Self::SpawnFailure => "EXEC001",
            Self::Timeout => "EXEC002",
            Self::NonzeroExit => "EXEC003",
            Self::StreamFailure => "EXEC004",
            Self::SshTransportFailure => "EXEC005",
            Self::SftpFailure => "EXEC006",
        }
    }

    pub fn is_validation(&self) -> bool {
        self.as_str().starts_with("SEC")
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validation-pipeline rejection.
///
/// Display strings are user-facing: they name the cause without leaking
/// absolute filesystem paths (working-directory rejections are pre-sanitized
/// by the pipeline before construction).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Command '{name}' is blocked")]
    BlockedCommand { name: String },

    #[error("Blocked operator '{operator}' in command")]
    BlockedOperator { operator: String },

    #[error("Unicode variant of blocked operator: {mimics} (found {codepoint})")]
    HomoglyphOperator { mimics: char, codepoint: String },

    #[error("Dangerous character in command: {threat} ({codepoint})")]
    DangerousCharacter { threat: String, codepoint: String },

    #[error("Malformed command: unclosed quote")]
    UnclosedQuote,

    #[error("Argument matches blocked pattern '{pattern}'")]
    BlockedArgument { pattern: String },

    #[error("Command exceeds maximum length of {max} ({length} characters)")]
    CommandTooLong { length: usize, max: usize },

    #[error("Working directory must be an absolute path")]
    WorkingDirNotAbsolute,

    #[error("Working directory does not exist or is not a directory")]
    WorkingDirMissing,

    #[error("Working directory is outside the allowed paths")]
    WorkingDirNotAllowed,

    #[error("Path is outside the allowed paths")]
    PathNotAllowed,

    #[error("Environment variable '{name}' is blocked")]
    BlockedEnvVar { name: String },

    #[error("Environment variable '{name}' rejected: {reason}")]
    EnvValueRejected { name: String, reason: String },

    #[error("Too many environment variables ({count}, maximum {max})")]
    EnvCountExceeded { count: usize, max: usize },

    #[error("Shell '{name}' is not enabled")]
    ShellNotEnabled { name: String },

    #[error("Unknown shell '{name}'")]
    UnknownShell { name: String },

    #[error("{reason}")]
    HostKeyMismatch { reason: String },

    #[error("{reason}")]
    UnknownHostStrict { reason: String },
}

impl PolicyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BlockedCommand { .. } => ErrorCode::BlockedCommand,
            Self::BlockedOperator { .. } | Self::HomoglyphOperator { .. } => {
                ErrorCode::BlockedOperator
            }
            Self::DangerousCharacter { .. } | Self::UnclosedQuote => ErrorCode::MalformedCommand,
            Self::BlockedArgument { .. } => ErrorCode::BlockedArgument,
            Self::CommandTooLong { .. } => ErrorCode::CommandTooLong,
            Self::WorkingDirNotAbsolute
            | Self::WorkingDirMissing
            | Self::WorkingDirNotAllowed
            | Self::PathNotAllowed => ErrorCode::PathNotAllowed,
            Self::BlockedEnvVar { .. }
            | Self::EnvValueRejected { .. }
            | Self::EnvCountExceeded { .. } => ErrorCode::BlockedEnvironment,
            Self::ShellNotEnabled { .. } | Self::UnknownShell { .. } => ErrorCode::BlockedCommand,
            Self::HostKeyMismatch { .. } => ErrorCode::HostKeyMismatch,
            Self::UnknownHostStrict { .. } => ErrorCode::UnknownHostStrict,
        }
    }

    /// Concrete remediation shown alongside the cause.
    pub fn user_guidance(&self) -> &'static str {
        match self {
            Self::BlockedCommand { .. } => {
                "Use check_security_config to list blocked commands, or choose a different command"
            }
            Self::BlockedOperator { .. } | Self::HomoglyphOperator { .. } => {
                "Remove shell operators and chaining; run each command separately"
            }
            Self::DangerousCharacter { .. } => {
                "Remove invisible or control characters; retype the command rather than pasting it"
            }
            Self::UnclosedQuote => "Close the open quote or remove it",
            Self::BlockedArgument { .. } => {
                "Use check_security_config to list blocked argument patterns"
            }
            Self::CommandTooLong { .. } => "Shorten the command or split it into steps",
            Self::WorkingDirNotAbsolute => "Pass an absolute path as the working directory",
            Self::WorkingDirMissing => "Create the directory first or pass an existing one",
            Self::WorkingDirNotAllowed | Self::PathNotAllowed => {
                "Use check_security_config to list allowed paths"
            }
            Self::BlockedEnvVar { .. } | Self::EnvValueRejected { .. } => {
                "Remove the variable from the call; credential-like names are never forwarded"
            }
            Self::EnvCountExceeded { .. } => "Reduce the number of per-call environment variables",
            Self::ShellNotEnabled { .. } | Self::UnknownShell { .. } => {
                "Use check_security_config to list enabled shells"
            }
            Self::HostKeyMismatch { .. } => {
                "If the host key change is expected, remove the pinned key with remove_known_host and reconnect"
            }
            Self::UnknownHostStrict { .. } => {
                "Connect once with strictHostKeyChecking disabled to pin the key, or add it manually"
            }
        }
    }

    /// The diagnostic tool that helps with this rejection.
    pub fn diagnostic_tool(&self) -> &'static str {
        match self {
            Self::DangerousCharacter { .. } | Self::UnclosedQuote => "validate_command",
            Self::HostKeyMismatch { .. } | Self::UnknownHostStrict { .. } => "validate_config",
            _ => "check_security_config",
        }
    }

    pub(crate) fn from_threat(threat: UnicodeThreat) -> Self {
        use super::unicode::ThreatKind;
        let codepoint = threat.codepoint_label();
        match threat.kind {
            ThreatKind::HomoglyphOperator { mimics } => {
                Self::HomoglyphOperator { mimics, codepoint }
            }
            kind => Self::DangerousCharacter {
                threat: kind.describe().to_string(),
                codepoint,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_taxonomy() {
        assert_eq!(
            PolicyError::BlockedCommand { name: "rm".into() }.code().as_str(),
            "SEC001"
        );
        assert_eq!(PolicyError::UnclosedQuote.code().as_str(), "SEC003");
        assert_eq!(
            PolicyError::CommandTooLong { length: 10, max: 5 }.code().as_str(),
            "SEC005"
        );
        assert_eq!(ErrorCode::SftpFailure.as_str(), "EXEC006");
    }

    #[test]
    fn test_validation_codes_are_sec() {
        assert!(ErrorCode::PathNotAllowed.is_validation());
        assert!(!ErrorCode::Timeout.is_validation());
    }

    #[test]
    fn test_blocked_command_message() {
        let err = PolicyError::BlockedCommand { name: "rm".into() };
        assert_eq!(err.to_string(), "Command 'rm' is blocked");
    }

    #[test]
    fn test_every_error_names_a_diagnostic() {
        let err = PolicyError::WorkingDirNotAllowed;
        assert_eq!(err.diagnostic_tool(), "check_security_config");
        assert!(!err.user_guidance().is_empty());
    }
}
