//! Reconnect scheduling.
//!
//! Delay for 1-indexed attempt n is `min(60s, 1s·2^(n-1) + jitter)` with
//! jitter uniform in [0, 1s). After ten failed attempts the connection is
//! marked permanently failed; reconnects are only scheduled while the
//! connection has seen activity in the last thirty minutes.

use std::time::Duration;

use rand::Rng;

pub const BASE_DELAY_MS: u64 = 1_000;
pub const MAX_DELAY_MS: u64 = 60_000;
pub const MAX_ATTEMPTS: u32 = 10;
pub const JITTER_MS: u64 = 1_000;

/// Idle cutoff: connections quiet for longer drop without reconnecting.
pub const IDLE_CUTOFF: Duration = Duration::from_secs(30 * 60);

/// Delay before reconnect attempt `attempt` (1-indexed).
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let exponential = BASE_DELAY_MS.saturating_mul(1u64 << shift);
    let jitter = rand::rng().random_range(0..JITTER_MS);
    Duration::from_millis(exponential.saturating_add(jitter).min(MAX_DELAY_MS))
}

/// Per-connection attempt counter.
#[derive(Debug, Default)]
pub struct ReconnectSchedule {
    attempts: u32,
}

impl ReconnectSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Register the next attempt and return its delay, or `None` once the
    /// attempt budget is exhausted (the connection is then failed).
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= MAX_ATTEMPTS {
            return None;
        }
        self.attempts += 1;
        Some(backoff_delay(self.attempts))
    }

    /// A successful connect resets the counter.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_range(attempt: u32, lo: u64, hi: u64) {
        for _ in 0..50 {
            let delay = backoff_delay(attempt).as_millis() as u64;
            assert!(
                (lo..hi).contains(&delay),
                "attempt {attempt}: {delay}ms outside [{lo}, {hi})"
            );
        }
    }

    #[test]
    fn test_delay_ranges_double() {
        assert_range(1, 1_000, 2_000);
        assert_range(2, 2_000, 3_000);
        assert_range(3, 4_000, 5_000);
        assert_range(4, 8_000, 9_000);
    }

    #[test]
    fn test_delay_capped_at_one_minute() {
        assert_range(10, 60_000, 60_001);
        assert_range(32, 60_000, 60_001);
    }

    #[test]
    fn test_schedule_exhausts_after_max_attempts() {
        let mut schedule = ReconnectSchedule::new();
        for n in 1..=MAX_ATTEMPTS {
            assert!(schedule.next_delay().is_some(), "attempt {n} should run");
        }
        assert!(schedule.next_delay().is_none());
        assert_eq!(schedule.attempts(), MAX_ATTEMPTS);
    }

    #[test]
    fn test_reset_restores_budget() {
        let mut schedule = ReconnectSchedule::new();
        for _ in 0..MAX_ATTEMPTS {
            schedule.next_delay();
        }
        schedule.reset();
        assert_eq!(schedule.attempts(), 0);
        let first = schedule.next_delay().expect("budget restored");
        assert!(first >= Duration::from_millis(1_000));
        assert!(first < Duration::from_millis(2_000));
    }
}
