//! Startup, checkout and release against the mock driver.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dbbroker_pool::{DriverRegistry, Pool, PoolConfig, PoolError, SlotStatus};
use dbbroker_testing::MockDriver;
use tokio::time::Instant;

use common::{Harness, config, open, open_with};

// =============================================================================
// Startup
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_open_creates_min_connections() {
    let Harness { driver, pool, .. } = open(3, 5).await;

    assert_eq!(pool.size(), 3);
    assert_eq!(pool.use_count(), 0);
    assert_eq!(driver.opened(), 3);
    assert!(pool.is_available());

    let status = pool.status();
    assert_eq!(status.total, 3);
    assert_eq!(status.available, 3);
    assert_eq!(status.max, 5);

    let target = &driver.targets()[0];
    assert_eq!(target.server_address, "mock://hazard");
    assert_eq!(target.credentials.username, "cybershk_ro");
}

#[tokio::test(start_paused = true)]
async fn test_open_logs_each_connection() {
    let harness = open(2, 2).await;
    let log = harness.log_contents();
    assert!(log.contains("opening connection 0 mock-conn-1"));
    assert!(log.contains("opening connection 1 mock-conn-2"));
    assert!(harness.log_path().with_extension("log.pid").exists());
}

#[tokio::test(start_paused = true)]
async fn test_open_through_registry() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let registry = DriverRegistry::new().with(driver.shared());

    let pool = Pool::open(config(&dir).min_connections(1), &registry)
        .await
        .unwrap();
    assert_eq!(pool.size(), 1);

    let err = Pool::open(config(&dir).driver("oracle"), &registry)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::UnknownDriver(id) if id == "oracle"));
}

#[tokio::test(start_paused = true)]
async fn test_open_retries_the_initial_batch() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    driver.fail_next_connects(1);

    let pool = Pool::with_driver(config(&dir).min_connections(2), driver.shared())
        .await
        .unwrap();
    assert_eq!(pool.size(), 2);
    assert_eq!(driver.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_open_fails_after_all_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    driver.refuse_connections(true);

    let err = Pool::with_driver(config(&dir).min_connections(2), driver.shared())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Init { attempts: 2, .. }));
    assert_eq!(driver.opened(), 0);
    assert_eq!(driver.targets().len(), 2);

    let log = std::fs::read_to_string(dir.path().join("db.log")).unwrap();
    assert!(log.contains("all attempts at connecting to the database exhausted"));
}

#[tokio::test(start_paused = true)]
async fn test_open_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let err = Pool::with_driver(
        config(&dir).min_connections(4).max_connections(2),
        driver.shared(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PoolError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_unwritable_log_falls_back_to_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let cfg = PoolConfig {
        log_destination: Some(dir.path().join("no-such-dir").join("db.log")),
        ..config(&dir)
    };

    let pool = Pool::with_driver(cfg, driver.shared()).await.unwrap();
    assert!(pool.log_path().exists());
    assert!(!pool.log_path().starts_with(dir.path()));

    let fallback = pool.log_path().to_path_buf();
    pool.destroy().await;
    let _ = std::fs::remove_file(&fallback);
    let mut marker = fallback.into_os_string();
    marker.push(".pid");
    let _ = std::fs::remove_file(marker);
}

// =============================================================================
// Checkout
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_round_robin_hands_out_distinct_slots() {
    let Harness { pool, .. } = open(4, 4).await;

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.checkout().await.unwrap());
    }

    let slots: HashSet<usize> = held.iter().map(|c| c.slot()).collect();
    let identities: HashSet<&str> = held.iter().map(|c| c.identity()).collect();
    assert_eq!(slots.len(), 4);
    assert_eq!(identities.len(), 4);
    assert_eq!(pool.use_count(), 4);
    assert_eq!(pool.size(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_rotates_after_release() {
    let Harness { pool, .. } = open(3, 3).await;

    let first = pool.checkout().await.unwrap();
    let first_slot = first.slot();
    assert!(pool.release(first));

    let second = pool.checkout().await.unwrap();
    assert_eq!(second.slot(), (first_slot + 1) % 3);
}

#[tokio::test(start_paused = true)]
async fn test_pool_grows_on_demand_up_to_capacity() {
    let Harness { driver, pool, .. } = open(1, 3).await;

    let a = pool.checkout().await.unwrap();
    let b = pool.checkout().await.unwrap();
    let c = pool.checkout().await.unwrap();
    assert_eq!(pool.size(), 3);
    assert_eq!(driver.opened(), 3);
    let status = pool.status();
    assert_eq!(status.total, status.max);
    assert_eq!(status.available, 0);

    let started = Instant::now();
    assert!(pool.get_connection().await.is_none());
    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(pool.size(), 3);
    assert_eq!(driver.opened(), 3);

    drop((a, b, c));
    assert_eq!(pool.use_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_returns_none_then_recovers_after_release() {
    let Harness { pool, .. } = open(2, 2).await;

    let first = pool.get_connection().await.unwrap();
    let _second = pool.get_connection().await.unwrap();

    let started = Instant::now();
    assert!(pool.get_connection().await.is_none());
    assert!(started.elapsed() >= Duration::from_secs(20));

    let err = pool.checkout().await.unwrap_err();
    assert!(matches!(err, PoolError::CheckoutExhausted { attempts: 10 }));

    assert!(pool.release(first));
    let started = Instant::now();
    let third = pool.get_connection().await;
    assert!(third.is_some());
    assert_eq!(started.elapsed(), Duration::ZERO);

    let metrics = pool.metrics();
    assert_eq!(metrics.checkouts_failed, 2);
    assert_eq!(metrics.checkouts_successful, 3);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_checkout_picks_up_released_connection() {
    let Harness { pool, .. } = open(1, 1).await;
    let held = pool.checkout().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.checkout().await.map(|c| c.identity().to_string()) })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    let identity = held.identity().to_string();
    assert!(pool.release(held));

    let got = waiter.await.unwrap().unwrap();
    assert_eq!(got, identity);
}

#[tokio::test(start_paused = true)]
async fn test_closed_handle_is_skipped() {
    let harness = open(2, 2).await;
    let dead = harness.identity_of(1).unwrap();
    harness.driver.drop_connection(&dead);

    let conn = harness.pool.checkout().await.unwrap();
    assert_ne!(conn.identity(), dead);
    assert_eq!(conn.slot(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_growth_failure_is_retried() {
    let Harness { driver, pool, .. } = open(1, 2).await;
    let _held = pool.checkout().await.unwrap();

    driver.fail_next_connects(1);
    let started = Instant::now();
    let conn = pool.checkout().await.unwrap();
    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert_eq!(conn.slot(), 1);
    assert_eq!(pool.size(), 2);
}

// =============================================================================
// Release
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_release_and_lookup() {
    let Harness { pool, .. } = open(2, 2).await;

    let conn = pool.checkout().await.unwrap();
    assert_eq!(pool.slot_of(&conn), Some(conn.slot()));

    let meta = pool.slot_metadata(conn.slot()).unwrap();
    assert_eq!(meta.status, SlotStatus::InUse);
    assert_eq!(meta.identity.as_deref(), Some(conn.identity()));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(conn.checked_out_for() >= Duration::from_secs(5));

    let slot = conn.slot();
    assert!(pool.release(conn));
    assert_eq!(pool.use_count(), 0);

    let meta = pool.slot_metadata(slot).unwrap();
    assert_eq!(meta.status, SlotStatus::Free);
    assert!(meta.checked_out_for.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_drop_returns_connection() {
    let Harness { pool, .. } = open(1, 1).await;
    {
        let _conn = pool.checkout().await.unwrap();
        assert_eq!(pool.use_count(), 1);
    }
    assert_eq!(pool.use_count(), 0);
    assert_eq!(pool.metrics().release_mismatches, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkouts_never_share_a_slot() {
    let Harness { pool, .. } = open_with(|c| {
        c.min_connections(2)
            .max_connections(4)
            .checkout_retry_interval(Duration::from_millis(5))
            .checkout_attempts(50)
    })
    .await;

    let held: Arc<parking_lot::Mutex<HashSet<usize>>> = Arc::default();
    let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        let held = Arc::clone(&held);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                let Some(mut conn) = pool.get_connection().await else {
                    continue;
                };
                let slot = conn.slot();
                {
                    let mut set = held.lock();
                    assert!(set.insert(slot), "slot {slot} handed out twice");
                    peak.fetch_max(set.len(), std::sync::atomic::Ordering::SeqCst);
                }
                conn.execute("UPDATE hazard_curves SET done = 1").await.unwrap();
                tokio::task::yield_now().await;
                held.lock().remove(&slot);
                pool.release(conn);
            }
        }));
    }

    for result in futures_util::future::join_all(tasks).await {
        result.unwrap();
    }

    assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 4);
    assert!(pool.size() <= 4);
    assert_eq!(pool.use_count(), 0);
    pool.destroy().await;
}
