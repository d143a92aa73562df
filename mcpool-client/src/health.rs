//! # Host Health
//!
//! Purpose: Remember which hosts recently refused connections and keep them
//! out of rotation for an exponentially growing backoff window.
//!
//! ## Design Principles
//! 1. **Exponential Backoff**: Each consecutive failure doubles the window,
//!    starting from [`MIN_BACKOFF`] and capped at [`MAX_BACKOFF`]; a
//!    successful connect resets it.
//! 2. **Caller-Supplied Clock**: The `_at` variants take `now` explicitly so
//!    the window edges are testable without sleeping.
//! 3. **Pure Bookkeeping**: Failover policy lives in the pool. When failover
//!    is disabled the pool never consults this table, but failures are still
//!    recorded so callers can inspect them.
//!
//! Not synchronized on its own; the pool mutates it under its state lock.

use std::time::{Duration, Instant};

use hashbrown::HashMap;

/// Backoff applied after the first failure.
pub const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Longest window a host stays dead after repeated failures.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeadRecord {
    declared_dead_at: Instant,
    backoff: Duration,
}

/// Per-host dead/alive tracking.
#[derive(Debug, Clone)]
pub struct HostHealth {
    records: HashMap<String, DeadRecord>,
    min_backoff: Duration,
}

impl Default for HostHealth {
    fn default() -> Self {
        HostHealth::new()
    }
}

impl HostHealth {
    pub fn new() -> Self {
        HostHealth::with_min_backoff(MIN_BACKOFF)
    }

    pub fn with_min_backoff(min_backoff: Duration) -> Self {
        HostHealth {
            records: HashMap::new(),
            min_backoff,
        }
    }

    pub fn is_dead(&self, host: &str) -> bool {
        self.is_dead_at(host, Instant::now())
    }

    /// True iff `now` falls inside `[declared_dead_at, declared_dead_at + backoff)`.
    pub fn is_dead_at(&self, host: &str, now: Instant) -> bool {
        match self.records.get(host) {
            Some(record) => {
                if now < record.declared_dead_at {
                    return false;
                }
                match record.declared_dead_at.checked_add(record.backoff) {
                    Some(until) => now < until,
                    None => true,
                }
            }
            None => false,
        }
    }

    pub fn mark_dead(&mut self, host: &str) -> Duration {
        self.mark_dead_at(host, Instant::now())
    }

    /// Records a failure at `now` and returns the new backoff.
    ///
    /// The backoff doubles for every failure not separated by a
    /// [`mark_alive`](Self::mark_alive), up to [`MAX_BACKOFF`] or the
    /// configured minimum if that is larger.
    pub fn mark_dead_at(&mut self, host: &str, now: Instant) -> Duration {
        if let Some(record) = self.records.get_mut(host) {
            record.declared_dead_at = now;
            record.backoff = record
                .backoff
                .saturating_mul(2)
                .min(MAX_BACKOFF.max(self.min_backoff));
            return record.backoff;
        }

        self.records.insert(
            host.to_string(),
            DeadRecord {
                declared_dead_at: now,
                backoff: self.min_backoff,
            },
        );
        self.min_backoff
    }

    /// Forgets any failure history for `host`.
    pub fn mark_alive(&mut self, host: &str) {
        self.records.remove(host);
    }

    /// Current backoff for `host`, if it has failed since its last success.
    pub fn backoff(&self, host: &str) -> Option<Duration> {
        self.records.get(host).map(|record| record.backoff)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "10.0.0.1:11211";

    #[test]
    fn unknown_hosts_are_alive() {
        let health = HostHealth::new();
        assert!(!health.is_dead(HOST));
        assert_eq!(health.backoff(HOST), None);
    }

    #[test]
    fn dead_window_is_half_open() {
        let mut health = HostHealth::new();
        let t = Instant::now();
        let backoff = health.mark_dead_at(HOST, t);
        assert_eq!(backoff, MIN_BACKOFF);

        assert!(health.is_dead_at(HOST, t));
        assert!(health.is_dead_at(HOST, t + backoff - Duration::from_nanos(1)));
        assert!(!health.is_dead_at(HOST, t + backoff));
    }

    #[test]
    fn consecutive_failures_double_backoff() {
        let mut health = HostHealth::new();
        let t = Instant::now();
        let first = health.mark_dead_at(HOST, t);
        let second = health.mark_dead_at(HOST, t + Duration::from_millis(10));
        let third = health.mark_dead_at(HOST, t + Duration::from_millis(20));
        assert_eq!(second, first * 2);
        assert_eq!(third, first * 4);
        assert!(health.is_dead_at(HOST, t + Duration::from_millis(20) + first * 3));
    }

    #[test]
    fn backoff_is_capped_after_many_failures() {
        let mut health = HostHealth::new();
        for _ in 0..100 {
            health.mark_dead(HOST);
        }
        assert_eq!(health.backoff(HOST), Some(MAX_BACKOFF));
        assert!(health.is_dead(HOST));

        let t = Instant::now();
        let backoff = health.mark_dead_at(HOST, t);
        assert_eq!(backoff, MAX_BACKOFF);
        assert!(health.is_dead_at(HOST, t + MAX_BACKOFF - Duration::from_millis(1)));
        assert!(!health.is_dead_at(HOST, t + MAX_BACKOFF));
    }

    #[test]
    fn huge_minimum_backoff_does_not_overflow() {
        let mut health = HostHealth::with_min_backoff(Duration::MAX);
        health.mark_dead(HOST);
        health.mark_dead(HOST);
        assert!(health.is_dead(HOST));
    }

    #[test]
    fn mark_alive_resets_to_minimum() {
        let mut health = HostHealth::with_min_backoff(Duration::from_millis(5));
        let t = Instant::now();
        health.mark_dead_at(HOST, t);
        health.mark_dead_at(HOST, t);
        assert_eq!(health.backoff(HOST), Some(Duration::from_millis(10)));

        health.mark_alive(HOST);
        assert!(!health.is_dead_at(HOST, t));
        assert_eq!(health.mark_dead_at(HOST, t), Duration::from_millis(5));
    }

    #[test]
    fn hosts_are_tracked_independently() {
        let mut health = HostHealth::new();
        let t = Instant::now();
        health.mark_dead_at(HOST, t);
        assert!(!health.is_dead_at("10.0.0.2:11211", t));
        health.clear();
        assert!(!health.is_dead_at(HOST, t));
    }
}
