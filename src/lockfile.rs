//! Advisory file locking and atomic document replacement.
//!
//! Both persistent documents (server config, known-hosts store) follow the
//! same discipline: an in-process async mutex keeps this process's writers
//! from ever contending the advisory lock with each other, the advisory
//! lock guards against other processes, and the payload is written to a
//! temp file and renamed into place so readers never observe a torn write.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fd_lock::RwLock;

const LOCK_RETRIES: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

fn lock_path_for(document: &Path) -> PathBuf {
    let mut name = document
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "document".into());
    name.push(".lock");
    document.with_file_name(name)
}

/// Run `critical` while holding the advisory write lock for `document`.
///
/// Acquisition retries a bounded number of times (other processes may hold
/// the lock) and fails with `WouldBlock` once the retries are exhausted.
/// The lock is released when `critical` resolves, success or not.
pub async fn with_write_lock<T, F, Fut>(document: &Path, critical: F) -> io::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let lock_path = lock_path_for(document);
    if let Some(parent) = lock_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;
    let mut lock = RwLock::new(file);

    let mut attempt = 0;
    let guard = loop {
        match lock.try_write() {
            Ok(guard) => break guard,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                attempt += 1;
                if attempt >= LOCK_RETRIES {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "advisory lock held by another process",
                    ));
                }
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    };

    let result = critical().await;
    drop(guard);
    result
}

/// Replace `path` atomically: write the payload to a sibling temp file,
/// flush, then rename over the destination.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "document".into());
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_atomic_write_creates_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("doc.json");

        atomic_write(&path, b"first").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        atomic_write(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_lock_scopes_to_critical_section() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("doc.json");

        with_write_lock(&doc, || async { Ok(()) }).await.unwrap();
        // Lock released: immediate re-acquisition must succeed.
        with_write_lock(&doc, || async { Ok(()) }).await.unwrap();
        assert!(dir.path().join("doc.json.lock").exists());
    }

    #[tokio::test]
    async fn test_critical_error_still_releases() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("doc.json");

        let err = with_write_lock(&doc, || async {
            Err::<(), _>(io::Error::other("boom"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "boom");

        with_write_lock(&doc, || async { Ok(()) }).await.unwrap();
    }
}
