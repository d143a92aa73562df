//! # Pool Maintainer
//!
//! Purpose: Periodically reconcile each host's available set toward
//! `[min_connections, max_connections]` and reclaim connections that callers
//! have held past the busy timeout.
//!
//! ## Design Principles
//! 1. **One Entry Point**: The background thread and callers both run
//!    [`ConnectionPool::maintain`], so a cycle can be driven by hand in tests.
//! 2. **Weak Ownership**: The thread holds a `Weak` pool reference and exits
//!    once the last pool handle is gone.
//! 3. **Prompt Stop**: The thread parks between cycles; stopping sets a flag,
//!    unparks it and joins.
//! 4. **Isolated Cycles**: A panicking cycle is logged and the next one runs
//!    on schedule.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::POOL_MULTIPLIER;
use crate::pool::{ConnectionPool, PoolInner};

/// Outcome of one maintenance cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Connections opened to top hosts up to `min_connections`.
    pub created: usize,
    /// Surplus idle connections closed.
    pub closed_idle: usize,
    /// Busy connections closed for exceeding `max_busy`.
    pub reclaimed_hung: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.closed_idle == 0 && self.reclaimed_hung == 0
    }
}

/// Handle to the background maintenance thread.
///
/// Dropping the handle stops the thread as well.
pub(crate) struct MaintainerHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MaintainerHandle {
    pub(crate) fn spawn(pool: Weak<PoolInner>, interval: Duration) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("mcpool-maintainer".to_string())
            .spawn(move || run(pool, interval, &stop_thread))?;

        info!(interval_ms = interval.as_millis() as u64, "pool maintainer started");
        Ok(MaintainerHandle {
            stop,
            join: Some(join),
        })
    }

    /// Stops the thread and waits for the running cycle to finish.
    pub(crate) fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(join) = self.join.take() else {
            return;
        };
        join.thread().unpark();
        // The thread may drop the last pool handle itself and land here.
        if join.thread().id() == thread::current().id() {
            return;
        }
        if join.join().is_err() {
            warn!("pool maintainer exited with a panic");
        }
        info!("pool maintainer stopped");
    }
}

impl Drop for MaintainerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run(pool: Weak<PoolInner>, interval: Duration, stop: &AtomicBool) {
    loop {
        let deadline = Instant::now() + interval;
        loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }

        let Some(inner) = pool.upgrade() else {
            debug!("pool dropped, maintainer exiting");
            return;
        };
        let pool = ConnectionPool::from_inner(inner);
        match panic::catch_unwind(AssertUnwindSafe(|| pool.maintain())) {
            Ok(report) if !report.is_empty() => debug!(
                created = report.created,
                closed_idle = report.closed_idle,
                reclaimed_hung = report.reclaimed_hung,
                "maintenance cycle finished"
            ),
            Ok(_) => {}
            Err(_) => error!("maintenance cycle panicked"),
        }
    }
}

impl ConnectionPool {
    /// Runs one maintenance cycle on the calling thread.
    ///
    /// Per host: opens connections until `min_connections` are available
    /// (stopping at the first failure), closes up to `excess / 4` surplus
    /// connections idle longer than `max_idle`, and resets the creation
    /// throttle. Then closes every busy connection held longer than
    /// `max_busy`; its holder sees the closure on its next read or write.
    pub fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let (snapshot, hosts) = {
            let state = self.inner().state.lock();
            let Some(snapshot) = state.snapshot() else {
                return report;
            };
            (snapshot, state.host_names())
        };
        let config = &snapshot.config;

        for host in hosts {
            let missing = {
                let state = self.inner().state.lock();
                if !state.is_current(snapshot.generation) {
                    return report;
                }
                config.min_connections.saturating_sub(state.available_count(&host))
            };
            for _ in 0..missing {
                let Some(conn) = self.create_connection(&host, &snapshot) else {
                    break;
                };
                if !self.stash_available(conn, snapshot.generation) {
                    return report;
                }
                report.created += 1;
            }

            let evicted = {
                let mut state = self.inner().state.lock();
                if !state.is_current(snapshot.generation) {
                    return report;
                }
                let available = state.available_count(&host);
                let evicted = if available > config.max_connections {
                    let excess = available - config.max_connections;
                    let limit = if excess <= POOL_MULTIPLIER {
                        excess
                    } else {
                        excess / POOL_MULTIPLIER
                    };
                    state.evict_idle(&host, limit, config.max_idle, Instant::now())
                } else {
                    Vec::new()
                };
                state.reset_shift(&host);
                evicted
            };
            if !evicted.is_empty() {
                debug!(host = %host, closed = evicted.len(), "closed surplus idle connections");
            }
            report.closed_idle += evicted.len();
            for mut conn in evicted {
                conn.close();
            }
        }

        let hung = {
            let mut state = self.inner().state.lock();
            if !state.is_current(snapshot.generation) {
                return report;
            }
            state.reclaim_hung(config.max_busy, Instant::now())
        };
        for reclaimed in hung {
            warn!(
                host = %reclaimed.host,
                id = reclaimed.handle.id(),
                busy_ms = reclaimed.busy_for.as_millis() as u64,
                "reclaiming hung connection"
            );
            if reclaimed.handle.close() {
                report.reclaimed_hung += 1;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report() {
        assert!(MaintenanceReport::default().is_empty());
        let report = MaintenanceReport {
            closed_idle: 1,
            ..MaintenanceReport::default()
        };
        assert!(!report.is_empty());
    }

    #[test]
    fn maintain_on_uninitialized_pool_is_a_no_op() {
        let pool = ConnectionPool::new();
        assert_eq!(pool.maintain(), MaintenanceReport::default());
    }

    #[test]
    fn thread_exits_when_pool_is_dropped() {
        let pool = ConnectionPool::new();
        let weak = Arc::downgrade(pool.inner());
        let handle = MaintainerHandle::spawn(weak, Duration::from_millis(5)).expect("spawn");
        drop(pool);
        thread::sleep(Duration::from_millis(30));
        assert!(handle.join.as_ref().is_some_and(|join| join.is_finished()));
        handle.stop();
    }

    #[test]
    fn stop_interrupts_a_long_interval() {
        let pool = ConnectionPool::new();
        let handle =
            MaintainerHandle::spawn(Arc::downgrade(pool.inner()), Duration::from_secs(3600))
                .expect("spawn");
        let started = Instant::now();
        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
