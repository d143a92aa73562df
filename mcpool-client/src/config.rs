//! # Pool Configuration
//!
//! Purpose: Describe the backend host set and every sizing, timeout and
//! routing knob of the pool. A configuration is frozen once the pool that
//! received it is initialized.
//!
//! ## Format
//!
//! Serializes to camelCase JSON with durations as integer milliseconds:
//!
//! ```json
//! {
//!   "hosts": [{ "address": "10.0.0.1:11211", "weight": 1 },
//!             { "address": "10.0.0.2:11211", "weight": 3 }],
//!   "initConnections": 3,
//!   "minConnections": 3,
//!   "maxConnections": 10,
//!   "maxIdleMillis": 180000,
//!   "maxBusyMillis": 300000,
//!   "maintenanceIntervalMillis": 5000,
//!   "connectTimeoutMillis": 50,
//!   "socketTimeoutMillis": 10000,
//!   "failoverEnabled": true,
//!   "hashingAlgorithm": "crc32",
//!   "tcpNoDelay": false
//! }
//! ```
//!
//! Omitted fields take the values from [`PoolConfig::default`].

use std::time::Duration;

use hashbrown::HashSet;
use mcpool_common::HashingAlgorithm;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Divisor shared by the creation throttle and idle trimming.
pub(crate) const POOL_MULTIPLIER: usize = 4;

/// One backend host and its share of the bucket list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Backend address, `host:port`.
    pub address: String,
    /// Number of bucket slots this host occupies.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl HostConfig {
    /// Creates a host entry with weight 1.
    pub fn new(address: impl Into<String>) -> Self {
        HostConfig {
            address: address.into(),
            weight: 1,
        }
    }

    /// Creates a host entry with an explicit weight.
    pub fn weighted(address: impl Into<String>, weight: u32) -> Self {
        HostConfig {
            address: address.into(),
            weight,
        }
    }
}

fn default_weight() -> u32 {
    1
}

/// Configuration for a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    /// Backend hosts in bucket order.
    pub hosts: Vec<HostConfig>,
    /// Connections opened per host during initialization.
    pub init_connections: usize,
    /// Idle connections maintenance keeps per host.
    pub min_connections: usize,
    /// Idle connections per host above which maintenance starts trimming.
    pub max_connections: usize,
    /// Idle time after which a surplus connection may be closed.
    #[serde(rename = "maxIdleMillis", with = "duration_millis")]
    pub max_idle: Duration,
    /// Checkout time after which a busy connection counts as hung.
    #[serde(rename = "maxBusyMillis", with = "duration_millis")]
    pub max_busy: Duration,
    /// Maintenance period; zero disables the background maintainer.
    #[serde(rename = "maintenanceIntervalMillis", with = "duration_millis")]
    pub maintenance_interval: Duration,
    /// Connect timeout; zero means a plain blocking connect.
    #[serde(rename = "connectTimeoutMillis", with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Read/write timeout applied to every socket; zero means none.
    #[serde(rename = "socketTimeoutMillis", with = "duration_millis")]
    pub socket_timeout: Duration,
    /// Re-route to other buckets and honor dead-host backoff.
    #[serde(rename = "failoverEnabled")]
    pub failover: bool,
    pub hashing_algorithm: HashingAlgorithm,
    /// Disable Nagle's algorithm on new sockets.
    pub tcp_no_delay: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            hosts: Vec::new(),
            init_connections: 3,
            min_connections: 3,
            max_connections: 10,
            max_idle: Duration::from_secs(3 * 60),
            max_busy: Duration::from_secs(5 * 60),
            maintenance_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_millis(50),
            socket_timeout: Duration::from_secs(10),
            failover: true,
            hashing_algorithm: HashingAlgorithm::Native,
            tcp_no_delay: false,
        }
    }
}

impl PoolConfig {
    /// Creates a configuration for `addresses`, each with weight 1.
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PoolConfig {
            hosts: addresses.into_iter().map(HostConfig::new).collect(),
            ..PoolConfig::default()
        }
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(text: &str) -> PoolResult<Self> {
        let config: PoolConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Appends a host with the given weight.
    pub fn host(mut self, address: impl Into<String>, weight: u32) -> Self {
        self.hosts.push(HostConfig::weighted(address, weight));
        self
    }

    pub fn init_connections(mut self, count: usize) -> Self {
        self.init_connections = count;
        self
    }

    pub fn min_connections(mut self, count: usize) -> Self {
        self.min_connections = count;
        self
    }

    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    pub fn max_idle(mut self, idle: Duration) -> Self {
        self.max_idle = idle;
        self
    }

    pub fn max_busy(mut self, busy: Duration) -> Self {
        self.max_busy = busy;
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    pub fn hashing_algorithm(mut self, algorithm: HashingAlgorithm) -> Self {
        self.hashing_algorithm = algorithm;
        self
    }

    pub fn tcp_no_delay(mut self, enabled: bool) -> Self {
        self.tcp_no_delay = enabled;
        self
    }

    /// Checks the invariants the pool relies on.
    pub fn validate(&self) -> PoolResult<()> {
        if self.hosts.is_empty() {
            return Err(PoolError::Configuration("no hosts configured".to_string()));
        }

        let mut seen = HashSet::with_capacity(self.hosts.len());
        for host in &self.hosts {
            if !is_host_port(&host.address) {
                return Err(PoolError::Configuration(format!(
                    "host `{}` is not of the form host:port",
                    host.address
                )));
            }
            if host.weight == 0 {
                return Err(PoolError::Configuration(format!(
                    "host `{}` has weight 0",
                    host.address
                )));
            }
            if !seen.insert(host.address.as_str()) {
                return Err(PoolError::Configuration(format!(
                    "host `{}` is listed twice",
                    host.address
                )));
            }
        }

        if self.min_connections > self.max_connections {
            return Err(PoolError::Configuration(format!(
                "minConnections ({}) exceeds maxConnections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Upper bound on connections opened in one creation burst.
    pub(crate) fn max_create(&self) -> usize {
        let max_create = if POOL_MULTIPLIER > self.min_connections {
            self.min_connections
        } else {
            self.min_connections / POOL_MULTIPLIER
        };
        max_create.max(1)
    }
}

fn is_host_port(address: &str) -> bool {
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
