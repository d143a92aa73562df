//! # Memcached Client Connection Pool
//!
//! Purpose: Route cache keys to backend hosts and hand callers ready-to-use
//! synchronous TCP connections, reused across requests and kept healthy by a
//! background maintainer.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Failure Absorption**: Dead hosts back off exponentially and keys fail
//!    over to other buckets instead of surfacing errors.
//! 3. **Explicit Ownership**: A checked-out [`Connection`] belongs to the
//!    caller until released; pools are values, not process globals.
//! 4. **Protocol Agnostic**: Connections expose line and byte-count framing;
//!    command encoding is left to the layer above.
//!
//! ## Example
//!
//! ```no_run
//! use mcpool_client::{ConnectionPool, PoolConfig};
//!
//! let pool = ConnectionPool::new();
//! pool.initialize(PoolConfig::new(["127.0.0.1:11211"]))?;
//!
//! if let Some(mut conn) = pool.checkout("user:42") {
//!     conn.write(b"get user:42\r\n")?;
//!     conn.flush()?;
//!     let header = conn.read_line()?;
//!     println!("{header}");
//! }
//! pool.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod connection;
mod error;
mod health;
mod maintainer;
mod pool;
mod registry;
mod state;

pub use config::{HostConfig, PoolConfig};
pub use connection::{ConnectOptions, Connection, ConnectionId};
pub use error::{ConnError, ConnResult, PoolError, PoolResult};
pub use health::{HostHealth, MAX_BACKOFF, MIN_BACKOFF};
pub use maintainer::MaintenanceReport;
pub use mcpool_common::HashingAlgorithm;
pub use pool::{ConnectionPool, PooledConnection};
pub use registry::{PoolRegistry, DEFAULT_POOL_NAME};
pub use state::HostStats;
