//! SSH subsystem errors.

use thiserror::Error;

use crate::security::{ErrorCode, PolicyError};

#[derive(Debug, Error)]
pub enum SshError {
    /// Host-key verification rejections (SEC008/SEC009) and path policy
    /// failures surface with their own taxonomy codes.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("SSH connection '{0}' is not configured")]
    UnknownConnection(String),

    #[error("SSH authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    #[error("SSH transport failure: {0}")]
    Transport(String),

    #[error("SSH connection permanently failed after {attempts} reconnect attempts")]
    PermanentlyFailed { attempts: u32 },

    #[error("SFTP operation failed: {0}")]
    Sftp(String),

    #[error("Remote path must be absolute (start with '/')")]
    RemotePathNotAbsolute,

    #[error("Local path is not an accepted absolute form")]
    LocalPathNotAbsolute,

    #[error("Refusing to delete protected system path '{0}'")]
    ProtectedRemotePath(String),

    #[error("Remote entry kind does not match the isDirectory flag")]
    KindMismatch,

    #[error("known-hosts store error: {0}")]
    Store(String),
}

impl SshError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Policy(policy) => policy.code(),
            Self::Sftp(_)
            | Self::RemotePathNotAbsolute
            | Self::LocalPathNotAbsolute
            | Self::ProtectedRemotePath(_)
            | Self::KindMismatch => ErrorCode::SftpFailure,
            _ => ErrorCode::SshTransportFailure,
        }
    }

    /// Validation-shaped failures map to exit code -2, transport to -1.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Policy(_)
                | Self::RemotePathNotAbsolute
                | Self::LocalPathNotAbsolute
                | Self::ProtectedRemotePath(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        Self::Transport(crate::sanitize::sanitize_message(&err.to_string()))
    }
}
