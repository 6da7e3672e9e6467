//! Bounded command history.
//!
//! A FIFO ring: appending beyond capacity drops the oldest entry first.
//! Entries are recorded for every completed call — validated or rejected —
//! so the history doubles as an audit trail of refusals.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const CLEANUP_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub command: String,
    pub output: String,
    /// ISO-8601 via chrono's serde impl.
    pub timestamp: DateTime<Utc>,
    /// 0 success, >0 child exit, -1 execution failure, -2 validation failure.
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl HistoryEntry {
    pub fn new(command: impl Into<String>, output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            command: command.into(),
            output: output.into(),
            timestamp: Utc::now(),
            exit_code,
            connection_id: None,
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }
}

#[derive(Clone)]
pub struct CommandHistory {
    entries: Arc<Mutex<VecDeque<HistoryEntry>>>,
    capacity: usize,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn record(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock().await;
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Most-recent-first window of at most `limit` entries, skipping
    /// `offset` from the newest end.
    pub async fn recent(&self, limit: usize, offset: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Defensive copy of everything, oldest first.
    pub async fn all(&self) -> Vec<HistoryEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Periodic re-assertion of the capacity bound. The ring never exceeds
    /// it through `record`, but the timer keeps the invariant honest against
    /// external mutation in tests and future callers.
    pub fn spawn_cleanup(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        let capacity = self.capacity;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let mut entries = entries.lock().await;
                        let before = entries.len();
                        while entries.len() > capacity {
                            entries.pop_front();
                        }
                        if before != entries.len() {
                            trace!(dropped = before - entries.len(), "history cleanup");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_eviction_at_capacity() {
        let history = CommandHistory::new(3);
        for i in 0..5 {
            history
                .record(HistoryEntry::new(format!("cmd{i}"), "", 0))
                .await;
        }
        let all = history.all().await;
        assert_eq!(all.len(), 3);
        // Oldest two were evicted; retained entries keep arrival order.
        let commands: Vec<_> = all.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(commands, vec!["cmd2", "cmd3", "cmd4"]);
    }

    #[tokio::test]
    async fn test_recent_is_most_recent_first() {
        let history = CommandHistory::new(10);
        for i in 0..4 {
            history
                .record(HistoryEntry::new(format!("cmd{i}"), "", 0))
                .await;
        }
        let page = history.recent(2, 0).await;
        let commands: Vec<_> = page.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(commands, vec!["cmd3", "cmd2"]);

        let next = history.recent(2, 2).await;
        let commands: Vec<_> = next.iter().map(|e| e.command.as_str()).collect();
        assert_eq!(commands, vec!["cmd1", "cmd0"]);
    }

    #[tokio::test]
    async fn test_clear_reports_count() {
        let history = CommandHistory::new(10);
        history.record(HistoryEntry::new("a", "", 0)).await;
        history.record(HistoryEntry::new("b", "", -2)).await;
        assert_eq!(history.clear().await, 2);
        assert!(history.is_empty().await);
    }

    #[tokio::test]
    async fn test_zero_capacity_holds_nothing() {
        let history = CommandHistory::new(0);
        history.record(HistoryEntry::new("a", "", 0)).await;
        assert_eq!(history.len().await, 0);
    }

    #[test]
    fn test_entry_serializes_iso8601_camel_case() {
        let entry = HistoryEntry::new("echo hi", "hi", 0).with_connection("web");
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["connectionId"], "web");
    }
}
