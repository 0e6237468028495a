//! Background housekeeping task.
//!
//! One task per pool, woken by a ticker. Each cycle:
//!
//! 1. checks the identity marker, and shuts the pool down if a newer
//!    instance has taken over the log path;
//! 2. drains driver warnings from resident connections;
//! 3. walks every slot: reclaims connections held past the checkout timeout,
//!    replaces connections past their maximum age, and probes the rest.
//!
//! A slot that is checked out and within its checkout budget is never
//! touched.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::DebugLevel;
use crate::driver::DriverConnection;
use crate::error::DriverError;
use crate::pool::PoolInner;
use crate::slot::{Lease, SlotStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Completed,
    Cancelled,
    Superseded,
}

enum RecycleReason {
    Leaked(Duration),
    Expired(Duration),
    ProbeFailed(String),
    Vacant,
}

impl fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaked(held) => write!(f, "not returned in time (held {held:?})"),
            Self::Expired(age) => write!(f, "reached maximum age ({age:?})"),
            Self::ProbeFailed(reason) => write!(f, "liveness probe failed: {reason}"),
            Self::Vacant => f.write_str("slot has no connection"),
        }
    }
}

/// What to do with a slot, decided under the status lock.
enum Action {
    Skip,
    Held(Duration),
    Probe(Box<dyn DriverConnection>),
    Reclaim {
        lease: Option<Arc<Lease>>,
        held: Duration,
    },
    Recycle {
        old: Option<Box<dyn DriverConnection>>,
        reason: RecycleReason,
    },
}

/// A replacement that did not make it into its slot.
enum Leftover {
    /// Opened after shutdown began.
    Unwanted(Box<dyn DriverConnection>),
    Failed(DriverError),
}

/// Start the housekeeping task.
///
/// The task holds only a weak reference to the pool and exits when the pool
/// is dropped, when `shutdown` is cancelled, or when the pool is superseded.
pub(crate) fn spawn(
    pool: Weak<PoolInner>,
    shutdown: CancellationToken,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(inner) = pool.upgrade() else {
                break;
            };
            let outcome = run_cycle(&inner, &shutdown).await;
            drop(inner);

            if outcome != Cycle::Completed {
                tracing::debug!(?outcome, "housekeeping cycle ended early");
                break;
            }
        }

        tracing::debug!("housekeeping task stopped");
    })
}

async fn run_cycle(inner: &PoolInner, shutdown: &CancellationToken) -> Cycle {
    match inner.marker.is_current().await {
        Ok(true) => {}
        Ok(false) => {
            supersede(inner, shutdown).await;
            return Cycle::Superseded;
        }
        Err(e) => inner.log.error(&format!(
            "can't read the identity marker {}: {e}",
            inner.marker.path().display()
        )),
    }

    drain_warnings(inner);

    let size = inner.slots.lock().size();
    for index in 0..size {
        if shutdown.is_cancelled() {
            return Cycle::Cancelled;
        }
        check_slot(inner, shutdown, index).await;
    }

    Cycle::Completed
}

/// A newer pool owns the marker: stop handing out connections and close
/// everything without further reporting.
async fn supersede(inner: &PoolInner, shutdown: &CancellationToken) {
    tracing::warn!(
        marker = %inner.marker.path().display(),
        instance = inner.marker.id(),
        "pool superseded by a newer instance, closing all connections"
    );
    inner
        .available
        .store(false, std::sync::atomic::Ordering::Release);
    shutdown.cancel();
    inner.log.close();
    inner.close_all().await;
}

fn drain_warnings(inner: &PoolInner) {
    let drained: Vec<(usize, Vec<String>)> = {
        let mut table = inner.slots.lock();
        table
            .slots_mut()
            .enumerate()
            .filter_map(|(index, slot)| {
                let warnings = slot.handle.as_mut()?.take_warnings();
                (!warnings.is_empty()).then_some((index, warnings))
            })
            .collect()
    };

    for (index, warnings) in drained {
        for warning in warnings {
            inner
                .log
                .warn(&format!("warnings on connection {index}: {warning}"));
        }
    }
}

async fn check_slot(inner: &PoolInner, shutdown: &CancellationToken, index: usize) {
    let checkout_timeout = inner.config.checkout_timeout;
    let max_age = inner.config.max_connection_age;

    let action = {
        let mut table = inner.slots.lock();
        let Some(slot) = table.slot_mut(index) else {
            return;
        };
        let now = Instant::now();

        match slot.status {
            SlotStatus::HousekeepingLocked => Action::Skip,
            SlotStatus::InUse => {
                let held = slot
                    .checkout_time
                    .map_or(Duration::ZERO, |t| now.duration_since(t));
                if !checkout_timeout.is_zero() && held > checkout_timeout {
                    let lease = slot.lease.take();
                    if let Some(lease) = lease.as_ref() {
                        lease.revoke();
                    }
                    slot.status = SlotStatus::HousekeepingLocked;
                    slot.checkout_time = None;
                    Action::Reclaim { lease, held }
                } else {
                    Action::Held(held)
                }
            }
            SlotStatus::Free => {
                slot.status = SlotStatus::HousekeepingLocked;
                let age = now.duration_since(slot.created_time);
                match slot.handle.take() {
                    None => Action::Recycle {
                        old: None,
                        reason: RecycleReason::Vacant,
                    },
                    Some(old) if age > max_age => Action::Recycle {
                        old: Some(old),
                        reason: RecycleReason::Expired(age),
                    },
                    Some(handle) => Action::Probe(handle),
                }
            }
        }
    };

    match action {
        Action::Skip => {}
        Action::Held(held) => {
            if inner.log.level() >= DebugLevel::Verbose {
                inner
                    .log
                    .info(&format!("connection {index} in use for {held:?}"));
            }
        }
        Action::Probe(mut handle) => {
            inner.metrics.lock().health_checks_performed += 1;
            let probe = handle.ping().await;
            match probe {
                Ok(()) if !handle.is_closed() => restore(inner, shutdown, index, handle).await,
                outcome => {
                    inner.metrics.lock().health_checks_failed += 1;
                    let reason = match outcome {
                        Err(e) => e.to_string(),
                        Ok(()) => "connection reports itself closed".to_string(),
                    };
                    recycle(
                        inner,
                        shutdown,
                        index,
                        Some(handle),
                        RecycleReason::ProbeFailed(reason),
                    )
                    .await;
                }
            }
        }
        Action::Reclaim { lease, held } => {
            // Waits out a statement the caller may still be running.
            let old = match lease {
                Some(lease) => lease.reclaim().await,
                None => None,
            };
            recycle(inner, shutdown, index, old, RecycleReason::Leaked(held)).await;
        }
        Action::Recycle { old, reason } => recycle(inner, shutdown, index, old, reason).await,
    }
}

/// Put a healthy handle back, unless shutdown began while it was out.
async fn restore(
    inner: &PoolInner,
    shutdown: &CancellationToken,
    index: usize,
    handle: Box<dyn DriverConnection>,
) {
    let leftover = {
        let mut table = inner.slots.lock();
        match table.slot_mut(index) {
            Some(slot) if !shutdown.is_cancelled() => {
                slot.handle = Some(handle);
                slot.status = SlotStatus::Free;
                None
            }
            _ => Some(handle),
        }
    };

    if let Some(mut handle) = leftover {
        let _ = handle.close().await;
        inner.metrics.lock().connections_closed += 1;
    }
}

/// Close the old handle (if the pool still has it) and open a replacement
/// in the same slot. A failed replacement leaves the slot free and empty;
/// the next checkout that reaches it opens a connection lazily.
async fn recycle(
    inner: &PoolInner,
    shutdown: &CancellationToken,
    index: usize,
    old: Option<Box<dyn DriverConnection>>,
    reason: RecycleReason,
) {
    inner
        .log
        .warn(&format!("recycling connection {index}: {reason}"));

    {
        let mut metrics = inner.metrics.lock();
        match reason {
            RecycleReason::Leaked(_) => metrics.leaks_recycled += 1,
            RecycleReason::Expired(_) => metrics.expired_recycled += 1,
            RecycleReason::ProbeFailed(_) | RecycleReason::Vacant => {}
        }
    }

    if let Some(mut old) = old {
        if let Err(e) = old.close().await {
            inner.log.error(&format!(
                "can't close connection {index}, might have been closed already, recycling anyway: {e}"
            ));
        }
        inner.metrics.lock().connections_closed += 1;
    }

    let opened = inner.driver.connect(&inner.target).await;

    let leftover = {
        let mut table = inner.slots.lock();
        let Some(slot) = table.slot_mut(index) else {
            return;
        };
        match opened {
            Ok(handle) if !shutdown.is_cancelled() => {
                let identity = handle.identity();
                slot.install(handle);
                Ok(identity)
            }
            Ok(handle) => {
                slot.vacate();
                Err(Leftover::Unwanted(handle))
            }
            Err(e) => {
                slot.vacate();
                Err(Leftover::Failed(e))
            }
        }
    };

    match leftover {
        Ok(identity) => {
            inner.metrics.lock().connections_created += 1;
            inner
                .log
                .event(&format!("opening connection {index} {identity}"));
        }
        Err(Leftover::Unwanted(mut handle)) => {
            inner.metrics.lock().connections_created += 1;
            let _ = handle.close().await;
            inner.metrics.lock().connections_closed += 1;
        }
        Err(Leftover::Failed(e)) => inner
            .log
            .error(&format!("failed to create connection {index}: {e}")),
    }
}
