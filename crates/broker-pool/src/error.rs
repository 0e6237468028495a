//! Pool and driver error types.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by a [`Driver`](crate::driver::Driver) or one of its
/// connections.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A statement failed on the server.
    #[error("statement failed: {0}")]
    Statement(String),

    /// The handle was already closed.
    #[error("connection closed")]
    Closed,

    /// IO error on the underlying transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur when using the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Invalid pool configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No driver is registered under the configured id.
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    /// Neither the configured log destination nor a temp file could be opened.
    #[error("can't open any log file: {0}")]
    Log(#[source] std::io::Error),

    /// The minimum set of connections could not be opened at startup.
    #[error("failed to open initial connections after {attempts} attempts: {source}")]
    Init {
        /// Number of batch attempts made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: DriverError,
    },

    /// The pool is shutting down or has been destroyed.
    #[error("pool is closed")]
    PoolClosed,

    /// No connection became free within the retry budget.
    #[error("no connection available after {attempts} attempts")]
    CheckoutExhausted {
        /// Number of outer checkout attempts made.
        attempts: u32,
    },

    /// The lease on a checked-out connection was revoked by the pool.
    ///
    /// This happens when a connection is held past the checkout timeout and
    /// recycled, or when the pool is force-closed during shutdown.
    #[error("connection was revoked by the pool")]
    ConnectionRevoked,

    /// A write was attempted through a read-only pool.
    #[error("pool is read-only")]
    ReadOnly,

    /// Shutdown had to close connections that were still checked out.
    #[error("unsafe shutdown: had to close {in_use} active connections after {waited:?}")]
    UnsafeShutdown {
        /// Connections still in use when they were closed.
        in_use: usize,
        /// Time waited for them to be released.
        waited: Duration,
    },

    /// Error from the underlying driver.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl PoolError {
    /// Check if this error is a soft failure the caller may retry later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CheckoutExhausted { .. } | Self::ConnectionRevoked
        )
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
