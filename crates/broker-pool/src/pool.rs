//! Connection pool implementation.
//!
//! This module holds the pool handle, startup, the round-robin checkout
//! router and release. Housekeeping lives in [`crate::housekeeper`],
//! shutdown in [`crate::lifecycle`] and the query helpers in
//! [`crate::facade`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::diagnostics::{DiagnosticLog, IdentityMarker};
use crate::driver::{ConnectTarget, Driver, DriverConnection, DriverRegistry, Rows};
use crate::error::{DriverError, PoolError, Result};
use crate::housekeeper;
use crate::slot::{Checkout, Lease, Scan, SlotStatus, SlotTable};

/// A self-managed pool of database connections.
///
/// Connections are handed out in round-robin order. A background
/// housekeeping task probes idle connections, replaces connections past
/// their maximum age, and reclaims connections held past the checkout
/// timeout.
///
/// `Pool` is a cheap handle; clones share the same connections. The pool is
/// shut down explicitly with [`destroy`](Pool::destroy) or
/// [`destroy_within`](Pool::destroy_within).
///
/// # Example
///
/// ```rust,ignore
/// use dbbroker_pool::{DriverRegistry, Pool, PoolConfig};
///
/// let config = PoolConfig::for_database("db.example.org", "hazard")
///     .credentials(Credentials::new("reader", "secret"))
///     .log_destination("/var/log/hazard/db.log");
///
/// let pool = Pool::open(config, &registry).await?;
/// let rows = pool.query("SELECT site_id FROM sites").await?;
/// pool.destroy().await;
/// ```
#[derive(Clone)]
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,

    pub(crate) driver: Arc<dyn Driver>,

    pub(crate) target: ConnectTarget,

    /// Slot status table. Never held across an `.await`.
    pub(crate) slots: Mutex<SlotTable>,

    /// Serializes pool growth so concurrent callers don't overshoot capacity.
    grow_lock: tokio::sync::Mutex<()>,

    /// Cleared when shutdown starts; no checkout succeeds afterwards.
    pub(crate) available: AtomicBool,

    read_only: AtomicBool,

    pub(crate) destroyed: AtomicBool,

    /// Stops the housekeeping task.
    pub(crate) shutdown: CancellationToken,

    pub(crate) housekeeper: Mutex<Option<JoinHandle<()>>>,

    pub(crate) log: DiagnosticLog,

    pub(crate) marker: IdentityMarker,

    created_at: Instant,

    pub(crate) metrics: Mutex<PoolMetricsInner>,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
pub(crate) struct PoolMetricsInner {
    pub(crate) connections_created: u64,
    pub(crate) connections_closed: u64,
    pub(crate) checkouts_successful: u64,
    pub(crate) checkouts_failed: u64,
    pub(crate) health_checks_performed: u64,
    pub(crate) health_checks_failed: u64,
    pub(crate) leaks_recycled: u64,
    pub(crate) expired_recycled: u64,
    pub(crate) release_mismatches: u64,
}

impl Pool {
    /// Open a pool using the driver registered under `config.driver_id`.
    pub async fn open(config: PoolConfig, registry: &DriverRegistry) -> Result<Self> {
        let driver = registry
            .get(&config.driver_id)
            .ok_or_else(|| PoolError::UnknownDriver(config.driver_id.clone()))?;
        Self::with_driver(config, driver).await
    }

    /// Open a pool with an explicit driver.
    ///
    /// Opens `min_connections` connections, retrying the whole batch up to
    /// `startup_attempts` times, then starts the housekeeping task.
    pub async fn with_driver(config: PoolConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        config.validate()?;
        let config = config.normalized();

        let log = DiagnosticLog::open(
            config.log_destination.as_deref(),
            config.log_append,
            config.debug_level,
        )?;

        let marker = IdentityMarker::new(log.marker_path());
        if let Err(e) = marker.write().await {
            log.error(&format!(
                "cannot write identity marker {}: {e}",
                marker.path().display()
            ));
        }

        let target = ConnectTarget::from_config(&config);
        let handles = open_initial(driver.as_ref(), &target, &config, &log).await?;

        let mut table = SlotTable::new(config.max_connections as usize);
        let mut created = 0;
        for handle in handles {
            let identity = handle.identity();
            if let Ok(index) = table.push(handle) {
                log.event(&format!("opening connection {index} {identity}"));
                created += 1;
            }
        }

        let inner = Arc::new(PoolInner {
            target,
            driver,
            slots: Mutex::new(table),
            grow_lock: tokio::sync::Mutex::new(()),
            available: AtomicBool::new(false),
            read_only: AtomicBool::new(config.read_only),
            destroyed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            housekeeper: Mutex::new(None),
            log,
            marker,
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner {
                connections_created: created,
                ..PoolMetricsInner::default()
            }),
            config,
        });

        let task = housekeeper::spawn(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            inner.config.housekeeping_interval,
        );
        *inner.housekeeper.lock() = Some(task);
        inner.available.store(true, Ordering::Release);

        tracing::info!(
            driver = inner.driver.id(),
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            log = %inner.log.path().display(),
            "connection pool opened"
        );

        Ok(Self { inner })
    }

    /// Check out a connection.
    ///
    /// Scans the slots round-robin for a free live connection, growing the
    /// pool by one connection when none is free and there is room. When the
    /// pool is exhausted, waits `checkout_retry_interval` and tries again, up
    /// to `checkout_attempts` times.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        let attempts = inner.config.checkout_attempts;

        for attempt in 1..=attempts {
            if !inner.is_available() {
                inner.log.error("checkout refused: pool is shutting down");
                inner.metrics.lock().checkouts_failed += 1;
                return Err(PoolError::PoolClosed);
            }

            if let Some(checkout) = inner.try_acquire().await {
                inner.metrics.lock().checkouts_successful += 1;
                inner.log.info(&format!(
                    "handing out connection {} {}",
                    checkout.index, checkout.identity
                ));
                return Ok(PooledConnection::new(checkout, Arc::clone(inner)));
            }

            if !inner.is_available() {
                inner.metrics.lock().checkouts_failed += 1;
                return Err(PoolError::PoolClosed);
            }

            inner.log.error(&format!(
                "connections exhausted, will wait and try again (attempt {attempt} of {attempts})"
            ));
            tokio::time::sleep(inner.config.checkout_retry_interval).await;
        }

        inner.metrics.lock().checkouts_failed += 1;
        Err(PoolError::CheckoutExhausted { attempts })
    }

    /// Check out a connection, or `None` if none became available.
    pub async fn get_connection(&self) -> Option<PooledConnection> {
        match self.checkout().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                tracing::debug!(error = %e, "no connection handed out");
                None
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// Returns `false` when the pool no longer tracks the connection, for
    /// example because it was reclaimed as leaked or the pool was destroyed.
    /// The untracked connection is closed.
    pub fn release(&self, conn: PooledConnection) -> bool {
        conn.release()
    }

    /// Number of connections currently checked out.
    #[must_use]
    pub fn use_count(&self) -> usize {
        self.inner.use_count()
    }

    /// Number of populated slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.slots.lock().size()
    }

    /// Slot index currently tracking `conn`, if any.
    #[must_use]
    pub fn slot_of(&self, conn: &PooledConnection) -> Option<usize> {
        self.inner.slots.lock().index_of(&conn.identity)
    }

    /// Metadata for one slot.
    #[must_use]
    pub fn slot_metadata(&self, index: usize) -> Option<ConnectionMetadata> {
        let table = self.inner.slots.lock();
        let slot = table.slot(index)?;
        let now = Instant::now();
        Some(ConnectionMetadata {
            index,
            status: slot.status,
            identity: slot.identity.clone(),
            age: now.duration_since(slot.created_time),
            checked_out_for: slot.checkout_time.map(|t| now.duration_since(t)),
        })
    }

    /// Whether the pool still hands out connections.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    /// Whether writes through [`execute`](Pool::execute) are rejected.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Acquire)
    }

    /// Allow or reject writes through [`execute`](Pool::execute).
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::Release);
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let table = self.inner.slots.lock();
        PoolStatus {
            available: table.free_count(),
            in_use: table.use_count(),
            total: table.size(),
            max: table.capacity(),
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            health_checks_performed: inner.health_checks_performed,
            health_checks_failed: inner.health_checks_failed,
            leaks_recycled: inner.leaks_recycled,
            expired_recycled: inner.expired_recycled,
            release_mismatches: inner.release_mismatches,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Path of the diagnostic log in use.
    #[must_use]
    pub fn log_path(&self) -> &std::path::Path {
        self.inner.log.path()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("driver", &self.inner.driver.id())
            .field("server", &self.inner.config.server_address)
            .field("status", &self.status())
            .finish()
    }
}

async fn open_initial(
    driver: &dyn Driver,
    target: &ConnectTarget,
    config: &PoolConfig,
    log: &DiagnosticLog,
) -> Result<Vec<Box<dyn DriverConnection>>> {
    let attempts = config.startup_attempts;
    let mut last_error = None;

    for attempt in 1..=attempts {
        let mut opened = Vec::with_capacity(config.min_connections as usize);
        let mut failure = None;

        for _ in 0..config.min_connections {
            match driver.connect(target).await {
                Ok(handle) => opened.push(handle),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let Some(e) = failure else {
            return Ok(opened);
        };

        log.error(&format!(
            "attempt {attempt} of {attempts} failed to create new connections set at startup: {e}"
        ));
        for mut handle in opened {
            let _ = handle.close().await;
        }
        last_error = Some(e);
    }

    log.error("all attempts at connecting to the database exhausted");
    Err(PoolError::Init {
        attempts,
        source: last_error.unwrap_or(DriverError::Closed),
    })
}

impl PoolInner {
    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn use_count(&self) -> usize {
        self.slots.lock().use_count()
    }

    /// One round of the checkout router: scan, and on a miss grow once and
    /// scan again.
    async fn try_acquire(&self) -> Option<Checkout> {
        if let Some(checkout) = self.scan_once().await {
            return Some(checkout);
        }
        if self.grow().await {
            return self.scan_once().await;
        }
        None
    }

    async fn scan_once(&self) -> Option<Checkout> {
        let scan = {
            let mut table = self.slots.lock();
            if !self.is_available() {
                return None;
            }
            table.scan()
        };
        match scan {
            Scan::Found(checkout) => Some(checkout),
            Scan::Reopen(index) => self.reopen(index).await,
            Scan::Empty => None,
        }
    }

    /// Open a connection into a free slot whose previous replacement failed.
    ///
    /// The slot was locked by the scan. If shutdown started while connecting,
    /// the new handle is closed and the slot left empty.
    async fn reopen(&self, index: usize) -> Option<Checkout> {
        let handle = match self.driver.connect(&self.target).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(slot) = self.slots.lock().slot_mut(index) {
                    slot.vacate();
                }
                self.log
                    .error(&format!("unable to reopen connection {index}: {e}"));
                return None;
            }
        };

        let identity = handle.identity();
        self.metrics.lock().connections_created += 1;
        let reopened = {
            let mut table = self.slots.lock();
            if self.is_available() {
                Ok(table.reopened(index, handle))
            } else {
                if let Some(slot) = table.slot_mut(index) {
                    slot.vacate();
                }
                Err(handle)
            }
        };

        match reopened {
            Ok(checkout) => {
                self.log
                    .event(&format!("opening connection {index} {identity}"));
                checkout
            }
            Err(handle) => {
                self.discard(handle).await;
                None
            }
        }
    }

    /// Add one connection if the pool is below capacity.
    async fn grow(&self) -> bool {
        let _growing = self.grow_lock.lock().await;
        let has_room = self.slots.lock().has_room();
        if !has_room || !self.is_available() {
            return false;
        }

        let handle = match self.driver.connect(&self.target).await {
            Ok(handle) => handle,
            Err(e) => {
                self.log
                    .error(&format!("unable to create new connection: {e}"));
                return false;
            }
        };

        let identity = handle.identity();
        self.metrics.lock().connections_created += 1;
        let pushed = {
            let mut table = self.slots.lock();
            if self.is_available() {
                table.push(handle)
            } else {
                Err(handle)
            }
        };

        match pushed {
            Ok(index) => {
                self.log
                    .event(&format!("opening connection {index} {identity}"));
                true
            }
            Err(handle) => {
                self.discard(handle).await;
                false
            }
        }
    }

    /// Close a freshly opened handle the table can't take.
    async fn discard(&self, mut handle: Box<dyn DriverConnection>) {
        if let Err(e) = handle.close().await {
            tracing::debug!(error = %e, "failed to close discarded connection");
        }
        self.metrics.lock().connections_closed += 1;
    }

    fn release_lease(&self, identity: &str, lease: &Arc<Lease>) -> bool {
        let released = self.slots.lock().release(identity, lease);
        match released {
            Ok(index) => {
                self.log
                    .info(&format!("freed connection {index} {identity}"));
                true
            }
            Err(orphan) => {
                self.metrics.lock().release_mismatches += 1;
                self.log.error(&format!(
                    "could not free connection {identity}: no longer tracked by the pool"
                ));
                if let Some(handle) = orphan {
                    self.metrics.lock().connections_closed += 1;
                    close_detached(handle);
                }
                false
            }
        }
    }

    /// Revoke every lease and close every handle, resident or checked out.
    ///
    /// A checked-out handle is closed once the statement running on it, if
    /// any, completes. Returns the number of handles closed.
    pub(crate) async fn close_all(&self) -> usize {
        let mut handles: Vec<(usize, Box<dyn DriverConnection>)> = Vec::new();
        let mut leases: Vec<(usize, Arc<Lease>)> = Vec::new();
        {
            let mut table = self.slots.lock();
            for (index, slot) in table.slots_mut().enumerate() {
                if let Some(lease) = slot.lease.take() {
                    lease.revoke();
                    leases.push((index, lease));
                }
                if let Some(handle) = slot.handle.take() {
                    handles.push((index, handle));
                }
                slot.vacate();
            }
        }

        for (index, lease) in leases {
            if let Some(handle) = lease.reclaim().await {
                handles.push((index, handle));
            }
        }

        let closed = handles.len();
        for (index, mut handle) in handles {
            if let Err(e) = handle.close().await {
                self.log
                    .error(&format!("cannot close connection {index}: {e}"));
            }
        }
        self.metrics.lock().connections_closed += closed as u64;
        closed
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Close a handle the pool no longer tracks without blocking the caller.
fn close_detached(mut handle: Box<dyn DriverConnection>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            let _ = handle.close().await;
        });
    }
}

/// A connection checked out of the pool.
///
/// The caller has exclusive use of the handle until it is released, either
/// with [`Pool::release`]/[`PooledConnection::release`] or by dropping it.
/// If the pool takes the connection back (it was held past the checkout
/// timeout, or the pool was destroyed), the pool closes it and every further
/// operation fails with [`PoolError::ConnectionRevoked`].
pub struct PooledConnection {
    index: usize,
    identity: String,
    lease: Arc<Lease>,
    checked_out_at: Instant,
    returned: bool,
    pool: Arc<PoolInner>,
}

type HandleGuard<'a> = tokio::sync::MutexGuard<'a, Option<Box<dyn DriverConnection>>>;

impl PooledConnection {
    fn new(checkout: Checkout, pool: Arc<PoolInner>) -> Self {
        Self {
            index: checkout.index,
            identity: checkout.identity,
            lease: checkout.lease,
            checked_out_at: checkout.checkout_time,
            returned: false,
            pool,
        }
    }

    /// Identity tag of the underlying connection.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Slot the connection was checked out from.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Time since the connection was handed out.
    #[must_use]
    pub fn checked_out_for(&self) -> Duration {
        self.checked_out_at.elapsed()
    }

    /// Whether the pool has revoked this checkout.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.lease.is_revoked()
    }

    async fn lock_handle(&self) -> Result<HandleGuard<'_>> {
        let guard = self.lease.handle().lock().await;
        if self.lease.is_revoked() || guard.is_none() {
            return Err(PoolError::ConnectionRevoked);
        }
        Ok(guard)
    }

    /// Run a statement that does not return rows.
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        let mut guard = self.lock_handle().await?;
        let handle = guard.as_mut().ok_or(PoolError::ConnectionRevoked)?;
        Ok(handle.execute(sql).await?)
    }

    /// Run a statement that returns rows.
    pub async fn query(&mut self, sql: &str) -> Result<Rows> {
        let mut guard = self.lock_handle().await?;
        let handle = guard.as_mut().ok_or(PoolError::ConnectionRevoked)?;
        Ok(handle.query(sql).await?)
    }

    /// Commit the current unit of work.
    pub async fn commit(&mut self) -> Result<()> {
        let mut guard = self.lock_handle().await?;
        let handle = guard.as_mut().ok_or(PoolError::ConnectionRevoked)?;
        Ok(handle.commit().await?)
    }

    /// Probe the connection.
    pub async fn ping(&mut self) -> Result<()> {
        let mut guard = self.lock_handle().await?;
        let handle = guard.as_mut().ok_or(PoolError::ConnectionRevoked)?;
        Ok(handle.ping().await?)
    }

    /// Return the connection to the pool.
    ///
    /// Returns `false` if the pool no longer tracks it.
    pub fn release(mut self) -> bool {
        self.give_back()
    }

    fn give_back(&mut self) -> bool {
        if std::mem::replace(&mut self.returned, true) {
            return false;
        }
        self.pool.release_lease(&self.identity, &self.lease)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.returned {
            tracing::trace!(
                slot = self.index,
                connection = %self.identity,
                "returning connection to pool"
            );
            self.give_back();
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.index)
            .field("identity", &self.identity)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

/// Snapshot of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// Slot index.
    pub index: usize,
    /// Current status.
    pub status: SlotStatus,
    /// Identity of the resident or checked-out handle.
    pub identity: Option<String>,
    /// Time since the current handle was opened.
    pub age: Duration,
    /// Time since checkout, while in use.
    pub checked_out_for: Option<Duration>,
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle live connections.
    pub available: usize,
    /// Number of connections currently in use.
    pub in_use: usize,
    /// Number of populated slots.
    pub total: usize,
    /// Maximum allowed connections.
    pub max: usize,
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections opened since pool start.
    pub connections_created: u64,
    /// Total connections closed by the pool.
    pub connections_closed: u64,
    /// Successful checkouts.
    pub checkouts_successful: u64,
    /// Failed checkouts (exhausted or pool closed).
    pub checkouts_failed: u64,
    /// Liveness probes performed.
    pub health_checks_performed: u64,
    /// Liveness probes that failed.
    pub health_checks_failed: u64,
    /// Connections reclaimed after exceeding the checkout timeout.
    pub leaks_recycled: u64,
    /// Connections replaced for exceeding the maximum age.
    pub expired_recycled: u64,
    /// Releases of connections the pool no longer tracked.
    pub release_mismatches: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}
