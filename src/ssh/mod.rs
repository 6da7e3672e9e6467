//! SSH session layer: pooled connections, TOFU host-key pinning, backoff
//! reconnection, and SFTP transfer.

pub mod backoff;
pub mod connection;
pub mod known_hosts;
pub mod pool;
pub mod sftp;

mod error;

pub use connection::{DetectedShell, SshCommandOutput, SshConnection};
pub use error::SshError;
pub use known_hosts::{HostKeyEntry, HostKeyStatus, KnownHostsStore};
pub use pool::ConnectionPool;
