//! # dbbroker-testing
//!
//! Test infrastructure for the dbbroker connection pool.
//!
//! [`MockDriver`] is a scriptable in-memory [`Driver`]: tests can make
//! connects fail, break individual connections, inject driver warnings,
//! and script statement results, then inspect what the pool did.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbbroker_testing::MockDriver;
//!
//! let driver = MockDriver::new();
//! driver.set_rows("SELECT 1", rows);
//! let pool = Pool::with_driver(config.driver(driver.id()), driver.shared()).await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use dbbroker_pool::{ConnectTarget, Driver, DriverConnection, DriverError, Rows};

/// Id mock drivers register under by default.
pub const MOCK_DRIVER_ID: &str = "mock";

/// Per-connection state the test can reach after the pool owns the handle.
#[derive(Debug, Default)]
struct ConnectionState {
    closed: AtomicBool,
    broken: AtomicBool,
    close_fails: AtomicBool,
    warnings: Mutex<Vec<String>>,
}

#[derive(Debug, Default)]
struct Shared {
    next_id: AtomicU64,
    failing_connects: AtomicU32,
    refuse_all: AtomicBool,
    connect_delay: Mutex<Duration>,
    opened: AtomicU64,
    closed: AtomicU64,
    commits: AtomicU64,
    connections: Mutex<HashMap<String, Arc<ConnectionState>>>,
    targets: Mutex<Vec<ConnectTarget>>,
    statements: Mutex<Vec<String>>,
    rows: Mutex<HashMap<String, Rows>>,
    affected: Mutex<HashMap<String, u64>>,
    failing_statements: Mutex<Vec<String>>,
}

/// Scriptable in-memory driver.
#[derive(Debug, Clone)]
pub struct MockDriver {
    id: String,
    shared: Arc<Shared>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a driver registered as [`MOCK_DRIVER_ID`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(MOCK_DRIVER_ID)
    }

    /// Create a driver with a custom id.
    #[must_use]
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shared: Arc::new(Shared::default()),
        }
    }

    /// This driver as a trait object sharing the same script and counters.
    #[must_use]
    pub fn shared(&self) -> Arc<dyn Driver> {
        Arc::new(self.clone())
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Fail every connect attempt until switched back.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Make every connect attempt take `delay` before it resolves.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock() = delay;
    }

    /// Make the connection's liveness probe fail.
    pub fn break_connection(&self, identity: &str) {
        if let Some(state) = self.state(identity) {
            state.broken.store(true, Ordering::SeqCst);
        }
    }

    /// Make the connection report itself closed, as if the server dropped it.
    pub fn drop_connection(&self, identity: &str) {
        if let Some(state) = self.state(identity) {
            state.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Make closing the connection return an error.
    pub fn fail_close(&self, identity: &str) {
        if let Some(state) = self.state(identity) {
            state.close_fails.store(true, Ordering::SeqCst);
        }
    }

    /// Queue a driver warning on a connection.
    pub fn add_warning(&self, identity: &str, warning: impl Into<String>) {
        if let Some(state) = self.state(identity) {
            state.warnings.lock().push(warning.into());
        }
    }

    /// Number of warnings still queued on a connection.
    #[must_use]
    pub fn pending_warnings(&self, identity: &str) -> usize {
        self.state(identity).map_or(0, |s| s.warnings.lock().len())
    }

    /// Script the result of a query.
    pub fn set_rows(&self, sql: impl Into<String>, rows: Rows) {
        self.shared.rows.lock().insert(sql.into(), rows);
    }

    /// Script the rows-affected count of a statement. Unscripted statements
    /// affect one row.
    pub fn set_affected(&self, sql: impl Into<String>, affected: u64) {
        self.shared.affected.lock().insert(sql.into(), affected);
    }

    /// Make a statement fail.
    pub fn fail_statement(&self, sql: impl Into<String>) {
        self.shared.failing_statements.lock().push(sql.into());
    }

    /// Connections opened so far.
    #[must_use]
    pub fn opened(&self) -> u64 {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Connections closed so far.
    #[must_use]
    pub fn closed(&self) -> u64 {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Commits issued so far.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Whether the named connection has been closed.
    #[must_use]
    pub fn is_closed(&self, identity: &str) -> bool {
        self.state(identity)
            .is_some_and(|s| s.closed.load(Ordering::SeqCst))
    }

    /// Identities of every connection ever opened, in order.
    #[must_use]
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.connections.lock().keys().cloned().collect();
        ids.sort_by_key(|id| sequence_of(id));
        ids
    }

    /// Targets passed to `connect`.
    #[must_use]
    pub fn targets(&self) -> Vec<ConnectTarget> {
        self.shared.targets.lock().clone()
    }

    /// Every statement run, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.shared.statements.lock().clone()
    }

    fn state(&self, identity: &str) -> Option<Arc<ConnectionState>> {
        self.shared.connections.lock().get(identity).cloned()
    }

    fn should_fail_connect(&self) -> bool {
        if self.shared.refuse_all.load(Ordering::SeqCst) {
            return true;
        }
        self.shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn sequence_of(identity: &str) -> u64 {
    identity
        .rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

#[async_trait]
impl Driver for MockDriver {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(
        &self,
        target: &ConnectTarget,
    ) -> Result<Box<dyn DriverConnection>, DriverError> {
        self.shared.targets.lock().push(target.clone());

        let delay = *self.shared.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail_connect() {
            tracing::debug!(server = %target.server_address, "mock connect refused");
            return Err(DriverError::Connect(format!(
                "{} refused the connection",
                target.server_address
            )));
        }

        let n = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let identity = format!("{}-conn-{n}", self.id);
        let state = Arc::new(ConnectionState::default());
        self.shared
            .connections
            .lock()
            .insert(identity.clone(), Arc::clone(&state));
        self.shared.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockConnection {
            identity,
            state,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Connection handed out by [`MockDriver`].
#[derive(Debug)]
pub struct MockConnection {
    identity: String,
    state: Arc<ConnectionState>,
    shared: Arc<Shared>,
}

impl MockConnection {
    fn check_open(&self) -> Result<(), DriverError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    fn run(&self, sql: &str) -> Result<(), DriverError> {
        self.check_open()?;
        self.shared.statements.lock().push(sql.to_string());
        if self.shared.failing_statements.lock().iter().any(|s| s == sql) {
            return Err(DriverError::Statement(format!("scripted failure: {sql}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut *self.state.warnings.lock())
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.check_open()?;
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(DriverError::Statement("connection reset by peer".into()));
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.run(sql)?;
        Ok(self.shared.affected.lock().get(sql).copied().unwrap_or(1))
    }

    async fn query(&mut self, sql: &str) -> Result<Rows, DriverError> {
        self.run(sql)?;
        Ok(self.shared.rows.lock().get(sql).cloned().unwrap_or_default())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.check_open()?;
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        let was_closed = self.state.closed.swap(true, Ordering::SeqCst);
        if !was_closed {
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
        }
        if self.state.close_fails.load(Ordering::SeqCst) {
            return Err(DriverError::Statement("close failed".into()));
        }
        if was_closed {
            return Err(DriverError::Closed);
        }
        Ok(())
    }
}
