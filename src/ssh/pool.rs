//! Connection pool with LRU and idle eviction.
//!
//! The pool owns every connection. Last-activity is tracked in its own map,
//! touched on each checkout; eviction picks the minimum. Permanently failed
//! connections report their id over a channel and a listener task removes
//! them — connections never hold a pointer back into the pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::backoff::IDLE_CUTOFF;
use super::connection::SshConnection;
use super::error::SshError;
use super::known_hosts::KnownHostsStore;
use crate::config::{SshConnectionConfig, SshSettings};

struct PoolInner {
    connections: HashMap<String, Arc<SshConnection>>,
    last_activity: HashMap<String, Instant>,
}

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    max_size: usize,
    known_hosts: Arc<KnownHostsStore>,
    settings: SshSettings,
    failure_tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl ConnectionPool {
    pub fn new(
        settings: SshSettings,
        known_hosts: Arc<KnownHostsStore>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<String>();
        let pool = Arc::new(Self {
            inner: Mutex::new(PoolInner {
                connections: HashMap::new(),
                last_activity: HashMap::new(),
            }),
            max_size: settings.max_pool_size.max(1),
            known_hosts,
            settings,
            failure_tx,
            shutdown: shutdown.clone(),
        });

        // Failure listener: failed connections ask to be removed by id.
        let weak = Arc::downgrade(&pool);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    id = failure_rx.recv() => {
                        let Some(id) = id else { break };
                        let Some(pool) = weak.upgrade() else { break };
                        info!(connection = %id, "removing permanently failed connection");
                        pool.remove(&id).await;
                    }
                }
            }
        });

        pool
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Checkout: evict idle and failed entries, make room, create lazily,
    /// and touch the activity clock.
    pub async fn get(
        &self,
        id: &str,
        config: &SshConnectionConfig,
    ) -> Result<Arc<SshConnection>, SshError> {
        let mut inner = self.inner.lock().await;

        // 1. Idle eviction.
        let now = Instant::now();
        let idle: Vec<String> = inner
            .last_activity
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > IDLE_CUTOFF)
            .map(|(id, _)| id.clone())
            .collect();
        for stale in idle {
            debug!(connection = %stale, "evicting idle connection");
            Self::drop_entry(&mut inner, &stale).await;
        }

        // 2. A failed entry is closed and replaced.
        if let Some(existing) = inner.connections.get(id) {
            if existing.has_failed() {
                debug!(connection = %id, "replacing failed connection");
                Self::drop_entry(&mut inner, id).await;
            }
        }

        // 3. LRU eviction when a new entry would overflow the pool.
        if !inner.connections.contains_key(id) && inner.connections.len() >= self.max_size {
            let lru = inner
                .last_activity
                .iter()
                .filter(|(existing, _)| inner.connections.contains_key(*existing))
                .min_by_key(|(_, last)| **last)
                .map(|(id, _)| id.clone());
            if let Some(lru) = lru {
                debug!(connection = %lru, "evicting least recently used connection");
                Self::drop_entry(&mut inner, &lru).await;
            }
        }

        // 4. Create on demand (the transport itself connects lazily).
        let connection = match inner.connections.get(id) {
            Some(existing) => Arc::clone(existing),
            None => {
                let connection = Arc::new(SshConnection::new(
                    id.to_string(),
                    config.clone(),
                    self.settings.clone(),
                    Arc::clone(&self.known_hosts),
                    self.failure_tx.clone(),
                    self.shutdown.child_token(),
                ));
                inner
                    .connections
                    .insert(id.to_string(), Arc::clone(&connection));
                connection
            }
        };

        // 5. Touch.
        inner.last_activity.insert(id.to_string(), Instant::now());
        connection.touch();
        Ok(connection)
    }

    async fn drop_entry(inner: &mut PoolInner, id: &str) {
        if let Some(connection) = inner.connections.remove(id) {
            connection.close().await;
        }
        inner.last_activity.remove(id);
    }

    pub async fn remove(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        Self::drop_entry(&mut inner, id).await;
    }

    /// Drop a caller-requested connection without marking it failed.
    pub async fn disconnect(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let present = inner.connections.contains_key(id);
        Self::drop_entry(&mut inner, id).await;
        present
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Shutdown: close every connection and clear both maps.
    pub async fn close_all(&self) {
        let mut inner = self.inner.lock().await;
        for (_, connection) in inner.connections.drain() {
            connection.close().await;
        }
        inner.last_activity.clear();
    }
}
