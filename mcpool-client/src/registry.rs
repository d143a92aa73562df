//! Named pool lookup for application wiring.
//!
//! A `PoolRegistry` is an ordinary value: create one at startup and pass it
//! (or the pools it hands out) to whoever needs them.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::pool::ConnectionPool;

/// Name used by [`PoolRegistry::default_pool`].
pub const DEFAULT_POOL_NAME: &str = "default";

/// Map from pool name to a shared [`ConnectionPool`].
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<Arc<str>, ConnectionPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        PoolRegistry::default()
    }

    /// Returns the pool registered under `name`, creating an uninitialized
    /// one on first use.
    pub fn get_or_create(&self, name: &str) -> ConnectionPool {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(name) {
            return pool.clone();
        }
        debug!(pool = name, "registering connection pool");
        let pool = ConnectionPool::new();
        pools.insert(Arc::from(name), pool.clone());
        pool
    }

    pub fn default_pool(&self) -> ConnectionPool {
        self.get_or_create(DEFAULT_POOL_NAME)
    }

    pub fn get(&self, name: &str) -> Option<ConnectionPool> {
        self.pools.lock().get(name).cloned()
    }

    /// Unregisters `name`. The pool keeps running for existing handles;
    /// call [`ConnectionPool::shutdown`] on the result to stop it.
    pub fn remove(&self, name: &str) -> Option<ConnectionPool> {
        self.pools.lock().remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.pools.lock().keys().map(|name| name.to_string()).collect()
    }

    /// Unregisters every pool and shuts each one down.
    pub fn shutdown_all(&self) {
        let pools: Vec<ConnectionPool> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.shutdown();
        }
    }
}
