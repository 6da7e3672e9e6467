//! Trust-on-first-use host key store.
//!
//! A JSON document keyed by `host:port`. A pinned key is never silently
//! overwritten: a differing key is a MITM indicator and the stored entry
//! stays untouched until the operator removes it explicitly.
//!
//! Persistence is doubly guarded. The in-process async mutex serializes all
//! logical writers so the cross-process advisory file lock is never
//! contended from one process (flock does not reenter cleanly); inside the
//! lock the document is re-read and the single change merged, so concurrent
//! processes never lose each other's pins.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::error::SshError;
use crate::lockfile::{atomic_write, with_write_lock};
use crate::security::PolicyError;

pub const DEFAULT_STORE_DIR: &str = ".win-cli-mcp";
pub const DEFAULT_STORE_FILE: &str = "known_hosts.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyEntry {
    pub algorithm: String,
    /// `SHA256:` + base64 digest of the wire-format key blob.
    pub fingerprint: String,
    /// Base64 of the wire-format key blob.
    pub key: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// First sighting, pinned under TOFU.
    Pinned,
    /// Matched the existing pin.
    Known,
}

/// `SHA256:`-prefixed OpenSSH-style fingerprint (unpadded base64).
pub fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// Read the length-prefixed algorithm name from an SSH wire-format key
/// blob. Parse failures degrade to `"unknown"` rather than rejecting.
pub fn parse_algorithm(key: &[u8]) -> Option<String> {
    if key.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([key[0], key[1], key[2], key[3]]) as usize;
    if len == 0 || len > 64 || key.len() < 4 + len {
        return None;
    }
    std::str::from_utf8(&key[4..4 + len])
        .ok()
        .map(str::to_string)
}

fn entry_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Default location: `~/.win-cli-mcp/known_hosts.json`.
pub fn default_store_path() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_STORE_DIR)
        .join(DEFAULT_STORE_FILE)
}

enum Change {
    Upsert(String, HostKeyEntry),
    Remove(String),
}

pub struct KnownHostsStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, HostKeyEntry>>,
}

impl KnownHostsStore {
    /// Open the store, loading any existing document.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SshError> {
        let path = path.into();
        let entries = Self::read_document(&path).map_err(|e| SshError::Store(e.to_string()))?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(path: &Path) -> io::Result<HashMap<String, HostKeyEntry>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err),
        }
    }

    /// Verify an incoming wire-format key for `host:port`.
    ///
    /// Unknown host: rejected in strict mode, pinned otherwise. Known host:
    /// accepted only when the key bytes match the pin; a differing key is
    /// rejected and the stored entry is left untouched.
    pub async fn verify(
        &self,
        host: &str,
        port: u16,
        key: &[u8],
        strict: bool,
    ) -> Result<HostKeyStatus, SshError> {
        let algorithm = parse_algorithm(key).unwrap_or_else(|| "unknown".to_string());
        let incoming_fingerprint = fingerprint(key);
        let encoded_key = STANDARD.encode(key);
        let id = entry_key(host, port);

        let mut entries = self.entries.lock().await;

        match entries.get(&id) {
            None if strict => {
                warn!(host = %id, fingerprint = %incoming_fingerprint, "unknown host in strict mode");
                Err(PolicyError::UnknownHostStrict {
                    reason: format!(
                        "Unknown host '{id}' with key fingerprint {incoming_fingerprint}. \
                         Strict host key checking is enabled, so unseen hosts are rejected. \
                         Disable strictHostKeyChecking for this connection to pin the key on \
                         first use, or add the key to the known-hosts store manually."
                    ),
                }
                .into())
            }
            None => {
                let now = Utc::now();
                let entry = HostKeyEntry {
                    algorithm,
                    fingerprint: incoming_fingerprint.clone(),
                    key: encoded_key,
                    first_seen: now,
                    last_seen: now,
                };
                self.persist(&mut entries, Change::Upsert(id.clone(), entry))
                    .await?;
                info!(host = %id, fingerprint = %incoming_fingerprint, "pinned new host key");
                Ok(HostKeyStatus::Pinned)
            }
            Some(existing) if existing.key == encoded_key => {
                let mut updated = existing.clone();
                updated.last_seen = Utc::now();
                self.persist(&mut entries, Change::Upsert(id, updated)).await?;
                Ok(HostKeyStatus::Known)
            }
            Some(existing) => {
                warn!(host = %id, "host key mismatch");
                Err(PolicyError::HostKeyMismatch {
                    reason: format!(
                        "HOST KEY MISMATCH for '{id}': the presented key ({incoming_fingerprint}) \
                         does not match the pinned key ({stored}). This can indicate a \
                         man-in-the-middle attack. The pinned entry in {path} was NOT changed; \
                         if the host key rotation is expected, remove the entry with \
                         remove_known_host and reconnect.",
                        stored = existing.fingerprint,
                        path = self.path.display(),
                    ),
                }
                .into())
            }
        }
    }

    /// Remove a pin; the next connection starts a fresh TOFU.
    pub async fn remove(&self, host: &str, port: u16) -> Result<bool, SshError> {
        let id = entry_key(host, port);
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(&id) {
            return Ok(false);
        }
        self.persist(&mut entries, Change::Remove(id)).await?;
        Ok(true)
    }

    /// Snapshot for diagnostics.
    pub async fn entries(&self) -> HashMap<String, HostKeyEntry> {
        self.entries.lock().await.clone()
    }

    /// Apply one change under the advisory lock: re-read the document,
    /// merge, write back atomically, and adopt the merged view in memory.
    /// Callers hold the entry mutex, so writers are already serialized.
    async fn persist(
        &self,
        entries: &mut HashMap<String, HostKeyEntry>,
        change: Change,
    ) -> Result<(), SshError> {
        let path = self.path.clone();
        let merged = with_write_lock(&self.path, || async move {
            let mut on_disk = Self::read_document(&path)?;
            match change {
                Change::Upsert(id, entry) => {
                    on_disk.insert(id, entry);
                }
                Change::Remove(id) => {
                    on_disk.remove(&id);
                }
            }
            let rendered = serde_json::to_vec_pretty(&on_disk)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            atomic_write(&path, &rendered).await?;
            Ok(on_disk)
        })
        .await
        .map_err(|e| SshError::Store(e.to_string()))?;

        *entries = merged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Minimal wire-format blob: length-prefixed algorithm name + payload.
    fn wire_key(algorithm: &str, payload: &[u8]) -> Vec<u8> {
        let mut key = (algorithm.len() as u32).to_be_bytes().to_vec();
        key.extend_from_slice(algorithm.as_bytes());
        key.extend_from_slice(payload);
        key
    }

    fn store(dir: &tempfile::TempDir) -> KnownHostsStore {
        KnownHostsStore::open(dir.path().join("known_hosts.json")).unwrap()
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"some key bytes");
        assert!(fp.starts_with("SHA256:"));
        // Unpadded base64 of a 32-byte digest is 43 characters.
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!(
            parse_algorithm(&wire_key("ssh-ed25519", b"payload")).as_deref(),
            Some("ssh-ed25519")
        );
        assert_eq!(parse_algorithm(b"\x00\x00"), None);
        assert_eq!(parse_algorithm(&[0, 0, 0, 200, b'x']), None);
    }

    #[tokio::test]
    async fn test_tofu_pins_then_recognizes() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = wire_key("ssh-ed25519", b"k1");

        let first = store.verify("bank.example.com", 22, &key, false).await.unwrap();
        assert_eq!(first, HostKeyStatus::Pinned);

        let again = store.verify("bank.example.com", 22, &key, false).await.unwrap();
        assert_eq!(again, HostKeyStatus::Known);

        let entries = store.entries().await;
        let entry = &entries["bank.example.com:22"];
        assert_eq!(entry.algorithm, "ssh-ed25519");
        assert!(entry.last_seen >= entry.first_seen);
    }

    #[tokio::test]
    async fn test_strict_rejects_unknown_without_storing() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let key = wire_key("ssh-ed25519", b"k1");

        let err = store
            .verify("bank.example.com", 22, &key, true)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("bank.example.com:22"));
        assert!(text.contains("SHA256:"));
        assert!(text.to_lowercase().contains("strict"));
        assert!(store.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_mismatch_rejected_and_pin_untouched() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let k1 = wire_key("ssh-ed25519", b"k1");
        let k2 = wire_key("ssh-ed25519", b"k2");

        store.verify("bank.example.com", 22, &k1, false).await.unwrap();
        let err = store
            .verify("bank.example.com", 22, &k2, false)
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("HOST KEY MISMATCH"));
        assert!(text.matches("SHA256:").count() >= 2);
        assert!(text.contains("known_hosts.json"));

        // On-disk pin still holds k1.
        let reopened = KnownHostsStore::open(dir.path().join("known_hosts.json")).unwrap();
        let entries = reopened.entries().await;
        assert_eq!(entries["bank.example.com:22"].fingerprint, fingerprint(&k1));
    }

    #[tokio::test]
    async fn test_ports_are_distinct_pins() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let k1 = wire_key("ssh-ed25519", b"k1");
        let k2 = wire_key("ssh-ed25519", b"k2");

        store.verify("host", 22, &k1, false).await.unwrap();
        // Different port: fresh TOFU, no mismatch.
        assert_eq!(
            store.verify("host", 2222, &k2, false).await.unwrap(),
            HostKeyStatus::Pinned
        );
    }

    #[tokio::test]
    async fn test_remove_allows_fresh_tofu() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let k1 = wire_key("ssh-ed25519", b"k1");
        let k2 = wire_key("ssh-ed25519", b"k2");

        store.verify("host", 22, &k1, false).await.unwrap();
        assert!(store.verify("host", 22, &k2, false).await.is_err());

        assert!(store.remove("host", 22).await.unwrap());
        assert!(!store.remove("host", 22).await.unwrap());

        assert_eq!(
            store.verify("host", 22, &k2, false).await.unwrap(),
            HostKeyStatus::Pinned
        );
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts.json");
        let key = wire_key("rsa-sha2-512", b"material");

        {
            let store = KnownHostsStore::open(&path).unwrap();
            store.verify("db.internal", 2200, &key, false).await.unwrap();
        }

        let store = KnownHostsStore::open(&path).unwrap();
        assert_eq!(
            store.verify("db.internal", 2200, &key, false).await.unwrap(),
            HostKeyStatus::Known
        );
    }

    #[tokio::test]
    async fn test_unparseable_algorithm_recorded_as_unknown() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let garbage = vec![0xFF, 0xFE, 0x01];

        store.verify("host", 22, &garbage, false).await.unwrap();
        assert_eq!(store.entries().await["host:22"].algorithm, "unknown");
    }
}
