//! Error types for connections and the pool.

/// Result type for single-connection operations.
pub type ConnResult<T> = Result<T, ConnError>;

/// Result type for pool-level operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by a [`Connection`](crate::Connection).
///
/// All of these are recoverable: the pool treats any of them during
/// acquisition as a failed attempt against that host.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Connect did not complete within the connect timeout, or was refused.
    #[error("failed to connect to {host}: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("read attempted on a closed connection")]
    ReadOnClosed,

    #[error("write attempted on a closed connection")]
    WriteOnClosed,

    /// The peer closed the stream before a single byte arrived.
    #[error("stream ended before any bytes were read")]
    StreamEmpty,

    #[error("stream ended after {received} of {expected} bytes")]
    UnexpectedEof { expected: usize, received: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by pool setup.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    #[error("failed to parse pool configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
