//! # dbbroker-pool
//!
//! Self-managed database connection broker.
//!
//! The pool owns a fixed-capacity table of connections opened through a
//! pluggable [`Driver`]. It hands connections out round-robin, grows lazily
//! up to its ceiling, and runs a background housekeeping task that recycles
//! broken, stale, and leaked connections.
//!
//! ## Features
//!
//! - Round-robin checkout with bounded retry and on-demand growth
//! - Liveness probes and age-based replacement of idle connections
//! - Leak detection: connections held past the checkout timeout are
//!   reclaimed and their leases revoked
//! - Self-termination when a newer pool instance takes over the log path
//! - Multi-phase shutdown that reports connections closed while in use
//! - Diagnostic log file gated by debug level, plus `tracing` events
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbbroker_pool::{Credentials, DriverRegistry, Pool, PoolConfig};
//!
//! let registry = DriverRegistry::new().with(Arc::new(MySqlDriver::default()));
//!
//! let config = PoolConfig::for_database("db.example.org", "hazard")
//!     .credentials(Credentials::new("reader", "secret"))
//!     .min_connections(2)
//!     .max_connections(20)
//!     .checkout_timeout_seconds(60)
//!     .read_only(false)
//!     .log_destination("/var/log/hazard/db.log");
//!
//! let pool = Pool::open(config, &registry).await?;
//!
//! // One-shot helpers
//! let inserted = pool.execute("INSERT INTO sites (name) VALUES ('USC')").await?;
//! let site = pool.query_first("SELECT site_id FROM sites WHERE name = 'USC'").await?;
//!
//! // Explicit checkout
//! let mut conn = pool.checkout().await?;
//! let rows = conn.query("SELECT * FROM ruptures").await?;
//! pool.release(conn);
//!
//! // Check pool status
//! let status = pool.status();
//! println!("{} of {} connections in use", status.in_use, status.max);
//!
//! pool.destroy_within(Duration::from_secs(5)).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
mod diagnostics;
pub mod driver;
pub mod error;
mod facade;
mod housekeeper;
pub mod lifecycle;
pub mod pool;
mod slot;

// Configuration
pub use config::{Credentials, DebugLevel, MIN_CONNECTION_AGE, PoolConfig};

// Driver seam
pub use driver::{ConnectTarget, Driver, DriverConnection, DriverRegistry, Row, Rows, Value};

// Error types
pub use error::{DriverError, PoolError, Result};

// Pool types
pub use lifecycle::DEFAULT_DESTROY_TIMEOUT;
pub use pool::{ConnectionMetadata, Pool, PoolMetrics, PoolStatus, PooledConnection};
pub use slot::SlotStatus;
