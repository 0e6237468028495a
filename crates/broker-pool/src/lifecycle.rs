//! Multi-phase pool shutdown.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{PoolError, Result};
use crate::pool::Pool;

/// Budget used by [`Pool::destroy`].
pub const DEFAULT_DESTROY_TIMEOUT: Duration = Duration::from_secs(10);

impl Pool {
    /// Shut the pool down, waiting up to `timeout` for checked-out
    /// connections to come back.
    ///
    /// 1. New checkouts are refused.
    /// 2. The housekeeping task is stopped.
    /// 3. `use_count()` is polled until it reaches zero or the budget runs
    ///    out; releases still land during this phase.
    /// 4. Every connection is closed, in use or not, and outstanding leases
    ///    are revoked.
    ///
    /// Returns [`PoolError::UnsafeShutdown`] if any connection was still in
    /// use when it was closed. Calling this again after a shutdown is a
    /// no-op.
    pub async fn destroy_within(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;

        inner.available.store(false, Ordering::Release);
        inner.log.event("shutting down: refusing new checkouts");

        inner.shutdown.cancel();
        let task = inner.housekeeper.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                inner
                    .log
                    .warn("housekeeping task did not stop within the shutdown budget");
            }
        }

        let mut in_use = inner.use_count();
        while in_use > 0 && Instant::now() < deadline {
            tokio::time::sleep(inner.config.shutdown_poll_interval).await;
            in_use = inner.use_count();
        }

        let closed = inner.close_all().await;
        tracing::info!(closed, in_use, "connection pool closed");

        if in_use > 0 {
            let err = PoolError::UnsafeShutdown {
                in_use,
                waited: timeout,
            };
            inner.log.error(&err.to_string());
            inner.log.close();
            return Err(err);
        }

        inner.log.event("pool destroyed");
        inner.log.close();
        Ok(())
    }

    /// Shut the pool down with [`DEFAULT_DESTROY_TIMEOUT`], ignoring whether
    /// connections had to be closed while in use.
    pub async fn destroy(&self) {
        if let Err(e) = self.destroy_within(DEFAULT_DESTROY_TIMEOUT).await {
            tracing::debug!(error = %e, "ignoring shutdown error");
        }
    }

    /// Whether the pool has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }
}
