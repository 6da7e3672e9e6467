//! SFTP transfer and listing operations.
//!
//! Every operation validates its paths first: remote paths must be
//! absolute, local paths must arrive in an accepted absolute form (drive
//! letter, UNC, WSL mount, WSL UNC, or Unix) and are normalized to the
//! platform's native spelling before allowlist containment is checked.
//! Sessions are always released, even on failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh_sftp::client::SftpSession;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::connection::SshConnection;
use super::error::SshError;
use crate::security::path as secpath;

/// Remote prefixes whose deletion is always refused.
const PROTECTED_REMOTE_PATHS: &[&str] = &[
    "/", "/home", "/root", "/etc", "/usr", "/var", "/bin", "/sbin",
];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpEntry {
    pub name: String,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Normalize a caller-supplied local path to a platform-native absolute
/// path. Accepted forms: Windows drive letter, UNC, WSL mount
/// (`/mnt/<letter>/…`), WSL UNC (`\\wsl.localhost\<distro>\…`), and Unix.
pub fn normalize_local_path(input: &str) -> Result<PathBuf, SshError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SshError::LocalPathNotAbsolute);
    }

    // WSL UNC: \\wsl.localhost\<distro>\path → native path inside the distro.
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.starts_with(r"\\wsl.localhost\") || lowered.starts_with(r"\\wsl$\") {
        let after_host = trimmed
            .trim_start_matches('\\')
            .splitn(2, '\\')
            .nth(1)
            .unwrap_or("");
        let path_part = after_host.splitn(2, '\\').nth(1).unwrap_or("");
        if path_part.is_empty() {
            return Err(SshError::LocalPathNotAbsolute);
        }
        #[cfg(windows)]
        return Ok(PathBuf::from(trimmed));
        #[cfg(not(windows))]
        return Ok(PathBuf::from(format!("/{}", path_part.replace('\\', "/"))));
    }

    // Windows drive letter.
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
    {
        #[cfg(windows)]
        return Ok(secpath::normalize_input(trimmed));
        #[cfg(not(windows))]
        {
            let drive = (bytes[0] as char).to_ascii_lowercase();
            let rest = trimmed[3..].replace('\\', "/");
            return Ok(PathBuf::from(format!("/mnt/{drive}/{rest}")));
        }
    }

    // Plain UNC.
    if trimmed.starts_with(r"\\") {
        #[cfg(windows)]
        return Ok(PathBuf::from(trimmed));
        #[cfg(not(windows))]
        return Err(SshError::LocalPathNotAbsolute);
    }

    // WSL mount on Windows maps back to the drive letter.
    #[cfg(windows)]
    if let Some(rest) = trimmed.strip_prefix("/mnt/") {
        let mut parts = rest.splitn(2, '/');
        if let Some(drive) = parts.next().and_then(|d| {
            (d.len() == 1 && d.as_bytes()[0].is_ascii_alphabetic()).then(|| d.to_string())
        }) {
            let tail = parts.next().unwrap_or("").replace('/', "\\");
            return Ok(PathBuf::from(format!(
                "{}:\\{tail}",
                drive.to_ascii_uppercase()
            )));
        }
    }

    // Unix absolute (covers /mnt/<letter> natively on Unix).
    if trimmed.starts_with('/') {
        return Ok(PathBuf::from(trimmed));
    }

    Err(SshError::LocalPathNotAbsolute)
}

fn validate_remote_path(path: &str) -> Result<&str, SshError> {
    if !path.starts_with('/') {
        return Err(SshError::RemotePathNotAbsolute);
    }
    Ok(path)
}

fn validate_local_path(input: &str, allowed: &[PathBuf]) -> Result<PathBuf, SshError> {
    let native = normalize_local_path(input)?;
    if !secpath::is_contained(&native, allowed) {
        return Err(crate::security::PolicyError::PathNotAllowed.into());
    }
    Ok(secpath::canonicalize(&native))
}

fn is_protected_remote(path: &str) -> bool {
    let trimmed = path.trim_end_matches('/');
    let candidate = if trimmed.is_empty() { "/" } else { trimmed };
    PROTECTED_REMOTE_PATHS
        .iter()
        .any(|protected| candidate == *protected)
}

async fn open_session(connection: &Arc<SshConnection>) -> Result<SftpSession, SshError> {
    let channel = connection.open_channel().await?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|err| SshError::Sftp(err.to_string()))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|err| SshError::Sftp(err.to_string()))
}

/// Run one operation on a fresh session, always releasing it afterwards.
async fn with_session<T, F>(
    connection: &Arc<SshConnection>,
    op: F,
) -> Result<T, SshError>
where
    F: AsyncFnOnce(&SftpSession) -> Result<T, SshError>,
{
    let session = open_session(connection).await?;
    let result = op(&session).await;
    let _ = session.close().await;
    result
}

/// Upload a local file; returns bytes copied.
pub async fn upload(
    connection: &Arc<SshConnection>,
    local: &str,
    remote: &str,
    allowed: &[PathBuf],
) -> Result<u64, SshError> {
    let remote = validate_remote_path(remote)?.to_string();
    let local = validate_local_path(local, allowed)?;

    with_session(connection, async |session: &SftpSession| {
        let mut source = tokio::fs::File::open(&local)
            .await
            .map_err(|err| SshError::Sftp(crate::sanitize::sanitize_io_error(&err)))?;
        let mut target = session
            .create(remote.as_str())
            .await
            .map_err(|err| SshError::Sftp(err.to_string()))?;
        let copied = copy_stream(&mut source, &mut target).await?;
        target
            .shutdown()
            .await
            .map_err(|err| SshError::Sftp(err.to_string()))?;
        debug!(bytes = copied, "sftp upload complete");
        Ok(copied)
    })
    .await
}

/// Download a remote file; returns bytes copied.
pub async fn download(
    connection: &Arc<SshConnection>,
    remote: &str,
    local: &str,
    allowed: &[PathBuf],
) -> Result<u64, SshError> {
    let remote = validate_remote_path(remote)?.to_string();
    let local = validate_local_path(local, allowed)?;

    with_session(connection, async |session: &SftpSession| {
        let mut source = session
            .open(remote.as_str())
            .await
            .map_err(|err| SshError::Sftp(err.to_string()))?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| SshError::Sftp(crate::sanitize::sanitize_io_error(&err)))?;
        }
        let mut target = tokio::fs::File::create(&local)
            .await
            .map_err(|err| SshError::Sftp(crate::sanitize::sanitize_io_error(&err)))?;
        let copied = copy_stream(&mut source, &mut target).await?;
        target
            .flush()
            .await
            .map_err(|err| SshError::Sftp(crate::sanitize::sanitize_io_error(&err)))?;
        debug!(bytes = copied, "sftp download complete");
        Ok(copied)
    })
    .await
}

/// List a remote directory.
pub async fn list(
    connection: &Arc<SshConnection>,
    remote: &str,
) -> Result<Vec<SftpEntry>, SshError> {
    let remote = validate_remote_path(remote)?.to_string();

    with_session(connection, async |session: &SftpSession| {
        let entries = session
            .read_dir(remote.as_str())
            .await
            .map_err(|err| SshError::Sftp(err.to_string()))?;
        let mut listing: Vec<SftpEntry> = entries
            .map(|entry| {
                let metadata = entry.metadata();
                SftpEntry {
                    name: entry.file_name(),
                    is_directory: entry.file_type().is_dir(),
                    size: metadata.size,
                }
            })
            .collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    })
    .await
}

/// Delete a remote file or (explicitly) a directory. The entry kind on the
/// server must match the flag, and system roots are refused outright.
pub async fn delete(
    connection: &Arc<SshConnection>,
    remote: &str,
    is_directory: bool,
) -> Result<(), SshError> {
    let remote = validate_remote_path(remote)?.to_string();
    if is_protected_remote(&remote) {
        return Err(SshError::ProtectedRemotePath(remote));
    }

    with_session(connection, async |session: &SftpSession| {
        let metadata = session
            .metadata(remote.as_str())
            .await
            .map_err(|err| SshError::Sftp(err.to_string()))?;
        if metadata.is_dir() != is_directory {
            return Err(SshError::KindMismatch);
        }
        if is_directory {
            session
                .remove_dir(remote.as_str())
                .await
                .map_err(|err| SshError::Sftp(err.to_string()))?;
        } else {
            session
                .remove_file(remote.as_str())
                .await
                .map_err(|err| SshError::Sftp(err.to_string()))?;
        }
        Ok(())
    })
    .await
}

async fn copy_stream<R, W>(source: &mut R, target: &mut W) -> Result<u64, SshError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let mut chunk = vec![0u8; 32 * 1024];
    loop {
        let n = source
            .read(&mut chunk)
            .await
            .map_err(|err| SshError::Sftp(crate::sanitize::sanitize_io_error(&err)))?;
        if n == 0 {
            break;
        }
        target
            .write_all(&chunk[..n])
            .await
            .map_err(|err| SshError::Sftp(crate::sanitize::sanitize_io_error(&err)))?;
        copied += n as u64;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path_must_be_absolute() {
        assert!(validate_remote_path("/srv/data/file.bin").is_ok());
        assert!(matches!(
            validate_remote_path("relative/file"),
            Err(SshError::RemotePathNotAbsolute)
        ));
        assert!(matches!(
            validate_remote_path("C:\\windows-style"),
            Err(SshError::RemotePathNotAbsolute)
        ));
    }

    #[test]
    fn test_protected_remote_roots() {
        for path in ["/", "/home", "/root", "/etc", "/usr", "/var", "/bin", "/sbin"] {
            assert!(is_protected_remote(path), "{path} should be protected");
        }
        assert!(is_protected_remote("/etc/"));
        assert!(!is_protected_remote("/etc/nginx"));
        assert!(!is_protected_remote("/srv"));
        assert!(!is_protected_remote("/home2"));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_normalize_drive_letter_to_wsl_mount() {
        assert_eq!(
            normalize_local_path(r"C:\Users\dev\file.txt").unwrap(),
            PathBuf::from("/mnt/c/Users/dev/file.txt")
        );
        assert_eq!(
            normalize_local_path("D:/data/out.bin").unwrap(),
            PathBuf::from("/mnt/d/data/out.bin")
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn test_normalize_wsl_unc() {
        assert_eq!(
            normalize_local_path(r"\\wsl.localhost\Ubuntu\home\dev\f").unwrap(),
            PathBuf::from("/home/dev/f")
        );
        assert_eq!(
            normalize_local_path(r"\\wsl$\Debian\etc\hosts").unwrap(),
            PathBuf::from("/etc/hosts")
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn test_normalize_plain_unc_rejected_off_windows() {
        assert!(normalize_local_path(r"\\server\share\f").is_err());
    }

    #[test]
    fn test_normalize_unix_absolute() {
        assert_eq!(
            normalize_local_path("/srv/data").unwrap(),
            PathBuf::from("/srv/data")
        );
    }

    #[test]
    fn test_normalize_rejects_relative() {
        assert!(normalize_local_path("relative/path").is_err());
        assert!(normalize_local_path("").is_err());
        assert!(normalize_local_path("   ").is_err());
    }

    #[test]
    fn test_local_containment_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let allowed = vec![root.clone()];

        let inside = root.join("payload.bin");
        assert!(validate_local_path(&inside.to_string_lossy(), &allowed).is_ok());

        let err = validate_local_path("/somewhere/else/f", &allowed).unwrap_err();
        assert!(err.is_validation());
    }
}
