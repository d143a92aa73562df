//! # Pool State
//!
//! Purpose: Hold everything the pool mutates under its single lock: the
//! bucket list, per-host available and busy sets, creation throttles and the
//! host health table.
//!
//! ## Design Principles
//! 1. **One Lock, Short Holds**: Every method here is O(set size) bookkeeping
//!    with no I/O. Sockets are opened and closed by the caller after the lock
//!    is released, so closures are returned instead of performed.
//! 2. **Exclusive Membership**: A connection id lives in at most one of a
//!    host's sets. Available entries own the `Connection`; busy entries only
//!    keep its close handle while the caller owns the connection.
//! 3. **Immutable Buckets**: The bucket list is built once per
//!    initialization and shared as `Arc<[_]>`, so routing reads it lock-free.
//! 4. **Generations**: Each initialization bumps a generation counter. Work
//!    that started before a shutdown sees a stale generation and backs off.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::config::PoolConfig;
use crate::connection::{CloseHandle, Connection, ConnectionId};
use crate::health::HostHealth;

/// Highest creation-throttle shift; caps a single burst at 2^16 connections.
const MAX_CREATE_SHIFT: u32 = 16;

struct IdleEntry {
    conn: Connection,
    since: Instant,
}

struct BusyEntry {
    handle: Arc<CloseHandle>,
    since: Instant,
}

#[derive(Default)]
struct HostSlots {
    available: HashMap<ConnectionId, IdleEntry>,
    busy: HashMap<ConnectionId, BusyEntry>,
    /// Connects handed out by `next_burst` and not yet settled.
    pending: usize,
    create_shift: u32,
}

/// Point-in-time counters for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStats {
    pub host: String,
    /// Idle connections ready for checkout.
    pub available: usize,
    /// Connections currently checked out.
    pub busy: usize,
    /// Host is inside its dead-backoff window.
    pub dead: bool,
}

/// What callers need to route and create connections without the lock.
#[derive(Clone)]
pub(crate) struct Snapshot {
    pub(crate) config: Arc<PoolConfig>,
    pub(crate) buckets: Arc<[Arc<str>]>,
    pub(crate) generation: u64,
}

/// Hung busy connection removed by maintenance.
pub(crate) struct Reclaimed {
    pub(crate) host: Arc<str>,
    pub(crate) handle: Arc<CloseHandle>,
    pub(crate) busy_for: Duration,
}

pub(crate) struct PoolState {
    initialized: bool,
    generation: u64,
    config: Option<Arc<PoolConfig>>,
    buckets: Arc<[Arc<str>]>,
    hosts: HashMap<Arc<str>, HostSlots>,
    pub(crate) health: HostHealth,
}

impl PoolState {
    pub(crate) fn new() -> Self {
        PoolState {
            initialized: false,
            generation: 0,
            config: None,
            buckets: Arc::from(Vec::new()),
            hosts: HashMap::new(),
            health: HostHealth::new(),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True while the pool is still in the initialization `generation`.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.initialized && self.generation == generation
    }

    /// Installs a validated configuration and returns the first snapshot.
    pub(crate) fn install(&mut self, config: Arc<PoolConfig>) -> Snapshot {
        self.buckets = build_buckets(&config).into();
        self.hosts = config
            .hosts
            .iter()
            .map(|host| (Arc::from(host.address.as_str()), HostSlots::default()))
            .collect();
        self.health.clear();
        self.config = Some(Arc::clone(&config));
        self.generation += 1;
        self.initialized = true;

        Snapshot {
            config,
            buckets: Arc::clone(&self.buckets),
            generation: self.generation,
        }
    }

    pub(crate) fn snapshot(&self) -> Option<Snapshot> {
        if !self.initialized {
            return None;
        }
        let config = self.config.as_ref()?;
        Some(Snapshot {
            config: Arc::clone(config),
            buckets: Arc::clone(&self.buckets),
            generation: self.generation,
        })
    }

    pub(crate) fn config(&self) -> Option<Arc<PoolConfig>> {
        self.config.clone()
    }

    /// Copies the host keys so callers can iterate without holding the lock.
    pub(crate) fn host_names(&self) -> Vec<Arc<str>> {
        self.hosts.keys().cloned().collect()
    }

    /// Moves a live available connection to the busy set and returns it.
    ///
    /// Disconnected entries met along the way are removed and returned for
    /// closing outside the lock.
    pub(crate) fn checkout_available(
        &mut self,
        host: &str,
        now: Instant,
    ) -> (Option<Connection>, Vec<Connection>) {
        let mut stale = Vec::new();
        let Some(slots) = self.hosts.get_mut(host) else {
            return (None, stale);
        };

        while let Some(id) = slots.available.keys().next().copied() {
            let Some(entry) = slots.available.remove(&id) else {
                break;
            };
            if entry.conn.is_connected() {
                slots.busy.insert(
                    id,
                    BusyEntry {
                        handle: Arc::clone(entry.conn.handle()),
                        since: now,
                    },
                );
                return (Some(entry.conn), stale);
            }
            stale.push(entry.conn);
        }
        (None, stale)
    }

    /// Size of the next creation burst for `host`: `min(2^shift, max_create)`,
    /// further limited to the room left under `max_total` counting available,
    /// busy and in-flight connections. Never less than one for a known host.
    ///
    /// The shift grows until the burst reaches `max_create`; maintenance
    /// resets it every cycle. The returned count is recorded as pending until
    /// [`settle_pending`](Self::settle_pending) is called for it.
    pub(crate) fn next_burst(&mut self, host: &str, max_create: usize, max_total: usize) -> usize {
        let Some(slots) = self.hosts.get_mut(host) else {
            return 0;
        };
        let create = 1usize << slots.create_shift;
        let throttled = if create >= max_create {
            max_create
        } else {
            slots.create_shift = (slots.create_shift + 1).min(MAX_CREATE_SHIFT);
            create
        };

        let total = slots.available.len() + slots.busy.len() + slots.pending;
        let room = max_total.saturating_sub(total).max(1);
        let burst = throttled.min(room);
        slots.pending += burst;
        burst
    }

    /// Marks `count` connects from an earlier burst as finished.
    pub(crate) fn settle_pending(&mut self, host: &str, count: usize) {
        if let Some(slots) = self.hosts.get_mut(host) {
            slots.pending = slots.pending.saturating_sub(count);
        }
    }

    pub(crate) fn reset_shift(&mut self, host: &str) {
        if let Some(slots) = self.hosts.get_mut(host) {
            slots.create_shift = 0;
        }
    }

    /// Files `conn` into its host's available set. Connections for unknown
    /// hosts are handed back.
    pub(crate) fn add_available(&mut self, conn: Connection, now: Instant) -> Result<(), Connection> {
        match self.hosts.get_mut(conn.host()) {
            Some(slots) => {
                slots.available.insert(conn.id(), IdleEntry { conn, since: now });
                Ok(())
            }
            None => Err(conn),
        }
    }

    pub(crate) fn insert_busy(&mut self, conn: &Connection, now: Instant) -> bool {
        match self.hosts.get_mut(conn.host()) {
            Some(slots) => {
                slots.busy.insert(
                    conn.id(),
                    BusyEntry {
                        handle: Arc::clone(conn.handle()),
                        since: now,
                    },
                );
                true
            }
            None => false,
        }
    }

    /// Drops `id` from the busy set; false if it was not there.
    pub(crate) fn remove_busy(&mut self, host: &str, id: ConnectionId) -> bool {
        self.hosts
            .get_mut(host)
            .map(|slots| slots.busy.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Empties the available set of `host`, e.g. after it refused a connect.
    pub(crate) fn clear_available(&mut self, host: &str) -> Vec<Connection> {
        match self.hosts.get_mut(host) {
            Some(slots) => slots.available.drain().map(|(_, entry)| entry.conn).collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn available_count(&self, host: &str) -> usize {
        self.hosts.get(host).map_or(0, |slots| slots.available.len())
    }

    pub(crate) fn busy_count(&self, host: &str) -> usize {
        self.hosts.get(host).map_or(0, |slots| slots.busy.len())
    }

    #[cfg(test)]
    pub(crate) fn is_available(&self, host: &str, id: ConnectionId) -> bool {
        self.hosts
            .get(host)
            .is_some_and(|slots| slots.available.contains_key(&id))
    }

    #[cfg(test)]
    pub(crate) fn is_busy(&self, host: &str, id: ConnectionId) -> bool {
        self.hosts
            .get(host)
            .is_some_and(|slots| slots.busy.contains_key(&id))
    }

    /// Removes up to `limit` connections idle for longer than `max_idle`,
    /// longest-idle first.
    pub(crate) fn evict_idle(
        &mut self,
        host: &str,
        limit: usize,
        max_idle: Duration,
        now: Instant,
    ) -> Vec<Connection> {
        let Some(slots) = self.hosts.get_mut(host) else {
            return Vec::new();
        };

        let mut candidates: Vec<(Instant, ConnectionId)> = slots
            .available
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.since) > max_idle)
            .map(|(id, entry)| (entry.since, *id))
            .collect();
        candidates.sort_unstable();

        candidates
            .into_iter()
            .take(limit)
            .filter_map(|(_, id)| slots.available.remove(&id))
            .map(|entry| entry.conn)
            .collect()
    }

    /// Removes busy entries checked out for longer than `max_busy`.
    ///
    /// Entries whose holder already closed or dropped the connection are
    /// pruned as well but not reported.
    pub(crate) fn reclaim_hung(&mut self, max_busy: Duration, now: Instant) -> Vec<Reclaimed> {
        let mut hung = Vec::new();
        for (host, slots) in self.hosts.iter_mut() {
            slots.busy.retain(|_, entry| {
                if !entry.handle.is_open() {
                    return false;
                }
                let busy_for = now.saturating_duration_since(entry.since);
                if busy_for > max_busy {
                    hung.push(Reclaimed {
                        host: Arc::clone(host),
                        handle: Arc::clone(&entry.handle),
                        busy_for,
                    });
                    return false;
                }
                true
            });
        }
        hung
    }

    pub(crate) fn host_stats(&self, now: Instant) -> Vec<HostStats> {
        let Some(config) = self.config.as_ref() else {
            return Vec::new();
        };
        config
            .hosts
            .iter()
            .map(|host| {
                let address = host.address.as_str();
                HostStats {
                    host: host.address.clone(),
                    available: self.available_count(address),
                    busy: self.busy_count(address),
                    dead: self.health.is_dead_at(address, now),
                }
            })
            .collect()
    }

    /// Resets to the uninitialized state, returning every pooled connection
    /// and busy handle so the caller can close them outside the lock.
    pub(crate) fn teardown(&mut self) -> (Vec<Connection>, Vec<Arc<CloseHandle>>) {
        let mut idle = Vec::new();
        let mut busy = Vec::new();
        for (_, mut slots) in self.hosts.drain() {
            idle.extend(slots.available.drain().map(|(_, entry)| entry.conn));
            busy.extend(slots.busy.drain().map(|(_, entry)| entry.handle));
        }

        self.initialized = false;
        self.config = None;
        self.buckets = Arc::from(Vec::new());
        self.health.clear();
        (idle, busy)
    }
}

/// Replicates each host `weight` times, in configuration order.
pub(crate) fn build_buckets(config: &PoolConfig) -> Vec<Arc<str>> {
    let mut buckets = Vec::with_capacity(config.hosts.iter().map(|h| h.weight as usize).sum());
    for host in &config.hosts {
        let address: Arc<str> = Arc::from(host.address.as_str());
        for _ in 0..host.weight {
            buckets.push(Arc::clone(&address));
        }
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectOptions;
    use std::net::TcpListener;

    fn options() -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(1),
            no_delay: false,
        }
    }

    /// Connections complete against the listen backlog; no accept needed.
    fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        (listener, addr)
    }

    fn installed(addr: &str) -> (PoolState, Snapshot) {
        let mut state = PoolState::new();
        let snapshot = state.install(Arc::new(PoolConfig::new([addr])));
        (state, snapshot)
    }

    #[test]
    fn buckets_follow_weights() {
        let config = PoolConfig::default().host("a:1", 1).host("b:2", 3);
        let buckets = build_buckets(&config);
        let names: Vec<&str> = buckets.iter().map(|b| &**b).collect();
        assert_eq!(names, vec!["a:1", "b:2", "b:2", "b:2"]);
    }

    #[test]
    fn burst_ramps_up_to_max_create() {
        let (mut state, _) = installed("a:1");
        let bursts: Vec<usize> = (0..5)
            .map(|_| state.next_burst("a:1", 5, usize::MAX))
            .collect();
        assert_eq!(bursts, vec![1, 2, 4, 5, 5]);

        state.reset_shift("a:1");
        assert_eq!(state.next_burst("a:1", 5, usize::MAX), 1);
        assert_eq!(state.next_burst("unknown:1", 5, usize::MAX), 0);
    }

    #[test]
    fn burst_stays_within_max_total() {
        let (mut state, _) = installed("a:1");
        state.next_burst("a:1", 8, 4);
        state.next_burst("a:1", 8, 4);
        // Three connects in flight leave room for one.
        assert_eq!(state.next_burst("a:1", 8, 4), 1);
        // At the limit a caller still gets one connect.
        assert_eq!(state.next_burst("a:1", 8, 4), 1);

        state.settle_pending("a:1", 5);
        state.reset_shift("a:1");
        state.next_burst("a:1", 8, 4);
        assert_eq!(state.next_burst("a:1", 8, 4), 2);
    }

    #[test]
    fn checkout_moves_connection_to_busy() {
        let (_listener, addr) = listener();
        let (mut state, _) = installed(&addr);
        let conn = Connection::open(addr.as_str(), options()).expect("open");
        let id = conn.id();
        assert!(state.add_available(conn, Instant::now()).is_ok());

        let (conn, stale) = state.checkout_available(&addr, Instant::now());
        let conn = conn.expect("checked out");
        assert!(stale.is_empty());
        assert_eq!(conn.id(), id);
        assert!(state.is_busy(&addr, id));
        assert!(!state.is_available(&addr, id));

        assert!(state.remove_busy(&addr, id));
        assert!(!state.remove_busy(&addr, id));
    }

    #[test]
    fn checkout_skips_disconnected_entries() {
        let (_listener, addr) = listener();
        let (mut state, _) = installed(&addr);
        let mut dead = Connection::open(addr.as_str(), options()).expect("open");
        dead.close();
        assert!(state.add_available(dead, Instant::now()).is_ok());

        let (conn, stale) = state.checkout_available(&addr, Instant::now());
        assert!(conn.is_none());
        assert_eq!(stale.len(), 1);
        assert_eq!(state.available_count(&addr), 0);
        assert_eq!(state.busy_count(&addr), 0);
    }

    #[test]
    fn evicts_longest_idle_first_up_to_limit() {
        let (_listener, addr) = listener();
        let (mut state, _) = installed(&addr);
        let base = Instant::now();
        let mut ids = Vec::new();
        for offset in 0..3u64 {
            let conn = Connection::open(addr.as_str(), options()).expect("open");
            ids.push(conn.id());
            assert!(state.add_available(conn, base + Duration::from_millis(offset)).is_ok());
        }

        let now = base + Duration::from_millis(100);
        let evicted = state.evict_idle(&addr, 2, Duration::from_millis(10), now);
        let evicted_ids: Vec<ConnectionId> = evicted.iter().map(|c| c.id()).collect();
        assert_eq!(evicted_ids, vec![ids[0], ids[1]]);
        assert_eq!(state.available_count(&addr), 1);

        let none = state.evict_idle(&addr, 5, Duration::from_secs(60), now);
        assert!(none.is_empty());
    }

    #[test]
    fn reclaims_only_hung_busy_entries() {
        let (_listener, addr) = listener();
        let (mut state, _) = installed(&addr);
        let base = Instant::now();
        let old = Connection::open(addr.as_str(), options()).expect("open");
        let fresh = Connection::open(addr.as_str(), options()).expect("open");
        let mut dropped = Connection::open(addr.as_str(), options()).expect("open");
        assert!(state.insert_busy(&old, base));
        assert!(state.insert_busy(&fresh, base + Duration::from_millis(90)));
        assert!(state.insert_busy(&dropped, base + Duration::from_millis(90)));
        dropped.close();

        let hung = state.reclaim_hung(Duration::from_millis(50), base + Duration::from_millis(100));
        assert_eq!(hung.len(), 1);
        assert_eq!(hung[0].handle.id(), old.id());
        assert_eq!(&*hung[0].host, addr.as_str());
        assert!(state.is_busy(&addr, fresh.id()));
        assert!(!state.is_busy(&addr, dropped.id()));
    }

    #[test]
    fn teardown_returns_everything_and_resets() {
        let (_listener, addr) = listener();
        let (mut state, snapshot) = installed(&addr);
        let idle = Connection::open(addr.as_str(), options()).expect("open");
        let busy = Connection::open(addr.as_str(), options()).expect("open");
        assert!(state.add_available(idle, Instant::now()).is_ok());
        assert!(state.insert_busy(&busy, Instant::now()));

        let (idle, handles) = state.teardown();
        assert_eq!(idle.len(), 1);
        assert_eq!(handles.len(), 1);
        assert!(!state.is_initialized());
        assert!(!state.is_current(snapshot.generation));
        assert!(state.snapshot().is_none());
        assert!(state.add_available(busy, Instant::now()).is_err());
    }

    #[test]
    fn reinstall_bumps_generation() {
        let (mut state, first) = installed("a:1");
        state.teardown();
        let second = state.install(Arc::new(PoolConfig::new(["a:1"])));
        assert!(second.generation > first.generation);
        assert!(state.is_current(second.generation));
    }
}
