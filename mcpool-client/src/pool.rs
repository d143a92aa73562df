//! # Connection Pool
//!
//! Purpose: Hand out ready-to-use backend connections by cache key, reuse
//! them across requests, and absorb backend failures through dead-host
//! backoff and bucket failover.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Per-host available sets keep sockets warm;
//!    checkout and return are O(1) bookkeeping under one pool-wide lock.
//! 2. **No I/O Under the Lock**: Connects and hard closes happen after the
//!    lock is released, so one slow host cannot stall acquisitions on others.
//! 3. **Throttled Creation**: An empty host gets `1, 2, 4, ...` new
//!    connections per burst up to a cap, instead of a connection storm.
//! 4. **Stable Routing Space**: Failed hosts stay in the bucket list and are
//!    skipped through their backoff window.
//!
//! ## Locking
//!
//! A single `parking_lot::Mutex<PoolState>` guards all pool bookkeeping.
//! Pool operations are rare next to the payload I/O callers do on their own
//! connections outside the lock, so per-host locks would add complexity for
//! no measured gain. A second mutex only serializes maintainer start/stop;
//! it is always taken before the state lock.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Instant;

use mcpool_common::HashRouter;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use crate::connection::{ConnectOptions, Connection};
use crate::error::PoolResult;
use crate::maintainer::MaintainerHandle;
use crate::state::{HostStats, PoolState, Snapshot};

pub(crate) struct PoolInner {
    pub(crate) state: Mutex<PoolState>,
    maintainer: Mutex<Option<MaintainerHandle>>,
}

/// Connection pool handle. Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool::new()
    }
}

impl ConnectionPool {
    /// Creates an uninitialized pool; call [`initialize`](Self::initialize).
    pub fn new() -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::new()),
                maintainer: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        ConnectionPool { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<PoolInner> {
        &self.inner
    }

    /// Builds the bucket list, warms `init_connections` per host and starts
    /// the maintainer.
    ///
    /// Warm-up is best-effort: a host that refuses is left empty. A second
    /// call while initialized is a no-op and ignores `config`.
    ///
    /// # Errors
    /// Returns `PoolError::Configuration` when `config` fails validation.
    pub fn initialize(&self, config: PoolConfig) -> PoolResult<()> {
        let snapshot = {
            let mut state = self.inner.state.lock();
            if state.is_initialized() {
                debug!("pool already initialized");
                return Ok(());
            }
            config.validate()?;
            state.install(Arc::new(config))
        };

        let config = &snapshot.config;
        info!(
            hosts = config.hosts.len(),
            buckets = snapshot.buckets.len(),
            init_connections = config.init_connections,
            failover = config.failover,
            "connection pool initialized"
        );

        for host in config.hosts.iter() {
            let host: Arc<str> = Arc::from(host.address.as_str());
            let mut warmed = 0;
            for _ in 0..config.init_connections {
                let Some(conn) = self.create_connection(&host, &snapshot) else {
                    break;
                };
                if !self.stash_available(conn, snapshot.generation) {
                    return Ok(());
                }
                warmed += 1;
            }
            debug!(host = %host, warmed, "initial connections opened");
        }

        self.start_maintainer(&snapshot);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().is_initialized()
    }

    /// The configuration in force, if initialized.
    pub fn config(&self) -> Option<Arc<PoolConfig>> {
        self.inner.state.lock().config()
    }

    /// Checks out a connection for `key`.
    ///
    /// Returns `None` when no host could serve the key: the pool is not
    /// initialized, the key is empty, or every candidate bucket failed. This
    /// is the normal backend-unavailable signal, not a program error.
    pub fn acquire(&self, key: &str) -> Option<Connection> {
        self.route_and_connect(key, None)
    }

    /// Like [`acquire`](Self::acquire), but the primary bucket comes from
    /// `hash` instead of hashing `key`.
    pub fn acquire_with_hash(&self, key: &str, hash: i32) -> Option<Connection> {
        self.route_and_connect(key, Some(hash))
    }

    /// Checks out a connection that returns itself to the pool on drop.
    pub fn checkout(&self, key: &str) -> Option<PooledConnection> {
        self.acquire(key).map(|conn| PooledConnection::new(self.clone(), conn))
    }

    /// Returns a checked-out connection.
    ///
    /// With `keep_alive` and a still-connected socket the connection goes
    /// back to its host's available set; otherwise it is hard-closed.
    /// Connections the pool no longer tracks as busy (reclaimed as hung, or
    /// from before a shutdown) are always closed.
    pub fn release(&self, mut conn: Connection, keep_alive: bool) {
        {
            let mut state = self.inner.state.lock();
            let was_busy = state.remove_busy(conn.host(), conn.id());
            if keep_alive && was_busy && conn.is_connected() {
                conn.touch();
                match state.add_available(conn, Instant::now()) {
                    Ok(()) => return,
                    Err(returned) => conn = returned,
                }
            }
        }
        trace!(id = conn.id(), host = %conn.host(), keep_alive, "closing released connection");
        conn.close();
    }

    /// Stops the maintainer, hard-closes every pooled and busy connection
    /// and returns the pool to the uninitialized state. Idempotent.
    pub fn shutdown(&self) {
        let mut maintainer = self.inner.maintainer.lock();
        if let Some(handle) = maintainer.take() {
            handle.stop();
        }

        let (idle, busy) = {
            let mut state = self.inner.state.lock();
            if !state.is_initialized() {
                return;
            }
            state.teardown()
        };
        drop(maintainer);

        let (closed_idle, closed_busy) = (idle.len(), busy.len());
        for mut conn in idle {
            conn.close();
        }
        for handle in busy {
            handle.close();
        }
        info!(closed_idle, closed_busy, "connection pool shut down");
    }

    /// Host that serves `key` on the first attempt, without connecting.
    pub fn host_for_key(&self, key: &str) -> Option<String> {
        let snapshot = self.inner.state.lock().snapshot()?;
        let router = HashRouter::new(snapshot.config.hashing_algorithm, snapshot.buckets.len());
        let bucket = router.route(key, 0)?;
        Some(snapshot.buckets[bucket].to_string())
    }

    /// True while `host` is inside its dead-backoff window.
    ///
    /// Failures are recorded even with failover disabled; only routing
    /// ignores them then.
    pub fn is_host_dead(&self, host: &str) -> bool {
        self.inner.state.lock().health.is_dead(host)
    }

    /// Per-host counters in configuration order; empty when uninitialized.
    pub fn stats(&self) -> Vec<HostStats> {
        self.inner.state.lock().host_stats(Instant::now())
    }

    fn route_and_connect(&self, key: &str, hash: Option<i32>) -> Option<Connection> {
        if key.is_empty() {
            return None;
        }
        let snapshot = self.inner.state.lock().snapshot()?;

        if snapshot.buckets.len() == 1 {
            return self.connection_for_host(&snapshot.buckets[0], &snapshot);
        }

        let router = HashRouter::new(snapshot.config.hashing_algorithm, snapshot.buckets.len());
        let probe = match hash {
            Some(hash) => router.probe_from(key, hash),
            None => router.probe(key),
        };

        for bucket in probe {
            let host = &snapshot.buckets[bucket];
            if let Some(conn) = self.connection_for_host(host, &snapshot) {
                return Some(conn);
            }
            if !snapshot.config.failover {
                return None;
            }
            trace!(host = %host, bucket, "bucket unavailable, failing over");
        }

        debug!(buckets = snapshot.buckets.len(), "every bucket failed for key");
        None
    }

    /// Checks out an available connection for `host`, or opens a throttled
    /// burst of new ones and returns the last.
    fn connection_for_host(&self, host: &Arc<str>, snapshot: &Snapshot) -> Option<Connection> {
        let (reused, stale, burst) = {
            let mut state = self.inner.state.lock();
            if !state.is_current(snapshot.generation) {
                return None;
            }
            let (reused, stale) = state.checkout_available(host, Instant::now());
            let burst = match reused {
                Some(_) => 0,
                None => state.next_burst(
                    host,
                    snapshot.config.max_create(),
                    snapshot.config.max_connections,
                ),
            };
            (reused, stale, burst)
        };

        if !stale.is_empty() {
            debug!(host = %host, discarded = stale.len(), "dropped disconnected idle connections");
        }
        drop(stale);

        if let Some(conn) = reused {
            trace!(id = conn.id(), host = %host, "reusing connection");
            return Some(conn);
        }

        let mut settled = 0;
        let mut result = None;
        for remaining in (1..=burst).rev() {
            let Some(conn) = self.create_connection(host, snapshot) else {
                break;
            };
            let mut state = self.inner.state.lock();
            if !state.is_current(snapshot.generation) {
                return None;
            }
            state.settle_pending(host, 1);
            settled += 1;
            if remaining == 1 {
                if state.insert_busy(&conn, Instant::now()) {
                    result = Some(conn);
                }
                break;
            }
            if state.add_available(conn, Instant::now()).is_err() {
                break;
            }
        }

        if settled < burst {
            let mut state = self.inner.state.lock();
            if state.is_current(snapshot.generation) {
                state.settle_pending(host, burst - settled);
            }
        }
        result
    }

    /// Opens a connection to `host` and records the outcome in host health.
    ///
    /// With failover enabled, hosts inside their backoff window are skipped
    /// without a connect attempt.
    pub(crate) fn create_connection(&self, host: &Arc<str>, snapshot: &Snapshot) -> Option<Connection> {
        if snapshot.config.failover && self.inner.state.lock().health.is_dead(host) {
            trace!(host = %host, "host in backoff, skipping connect");
            return None;
        }

        match Connection::open(Arc::clone(host), ConnectOptions::from(&*snapshot.config)) {
            Ok(conn) => {
                let mut state = self.inner.state.lock();
                if state.is_current(snapshot.generation) {
                    state.health.mark_alive(host);
                }
                Some(conn)
            }
            Err(err) => {
                let (backoff, stale) = {
                    let mut state = self.inner.state.lock();
                    if !state.is_current(snapshot.generation) {
                        return None;
                    }
                    let backoff = state.health.mark_dead(host);
                    (backoff, state.clear_available(host))
                };
                warn!(
                    host = %host,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    discarded = stale.len(),
                    "connect failed, host marked dead"
                );
                for mut conn in stale {
                    conn.close();
                }
                None
            }
        }
    }

    /// Adds a fresh connection to the available set if the pool is still in
    /// `generation`; otherwise closes it and returns false.
    pub(crate) fn stash_available(&self, conn: Connection, generation: u64) -> bool {
        let mut state = self.inner.state.lock();
        if !state.is_current(generation) {
            return false;
        }
        state.add_available(conn, Instant::now()).is_ok()
    }

    fn start_maintainer(&self, snapshot: &Snapshot) {
        let interval = snapshot.config.maintenance_interval;
        if interval.is_zero() {
            return;
        }

        let mut maintainer = self.inner.maintainer.lock();
        if maintainer.is_some() || !self.inner.state.lock().is_current(snapshot.generation) {
            return;
        }
        match MaintainerHandle::spawn(Arc::downgrade(&self.inner), interval) {
            Ok(handle) => *maintainer = Some(handle),
            Err(err) => warn!(error = %err, "failed to start pool maintainer"),
        }
    }
}

/// RAII guard returning a connection to the pool on drop.
///
/// Derefs to [`Connection`]. Call [`discard`](Self::discard) after an I/O
/// or protocol error so the connection is closed instead of reused.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Connection>,
    keep_alive: bool,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            keep_alive: true,
        }
    }

    /// Marks the connection as broken; it is hard-closed on drop.
    pub fn discard(&mut self) {
        self.keep_alive = false;
    }

    /// Detaches the connection from the guard; the caller must release it.
    pub fn into_inner(mut self) -> Connection {
        match self.conn.take() {
            Some(conn) => conn,
            None => unreachable!("pooled connection already taken"),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection already taken"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("pooled connection already taken"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.keep_alive);
        }
    }
}
