//! Shared fixtures for pool integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::time::Duration;

use dbbroker_pool::{Credentials, DebugLevel, Pool, PoolConfig};
use dbbroker_testing::{MOCK_DRIVER_ID, MockDriver};
use tempfile::TempDir;

/// One housekeeping period plus a margin.
pub const ONE_CYCLE: Duration = Duration::from_secs(21);

pub struct Harness {
    pub driver: MockDriver,
    pub pool: Pool,
    pub dir: TempDir,
}

impl Harness {
    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("db.log")
    }

    pub fn log_contents(&self) -> String {
        std::fs::read_to_string(self.log_path()).unwrap_or_default()
    }

    /// Identity of the connection resident in a slot.
    pub fn identity_of(&self, index: usize) -> Option<String> {
        self.pool.slot_metadata(index).and_then(|m| m.identity)
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn config(dir: &TempDir) -> PoolConfig {
    PoolConfig::new()
        .driver(MOCK_DRIVER_ID)
        .server("mock://hazard")
        .credentials(Credentials::new("cybershk_ro", "secret"))
        .log_destination(dir.path().join("db.log"))
        .debug_level(DebugLevel::Verbose)
}

pub async fn open(min: u32, max: u32) -> Harness {
    open_with(|c| c.min_connections(min).max_connections(max)).await
}

pub async fn open_with(customize: impl FnOnce(PoolConfig) -> PoolConfig) -> Harness {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let driver = MockDriver::new();
    let pool = Pool::with_driver(customize(config(&dir)), driver.shared())
        .await
        .expect("pool should open");
    Harness { driver, pool, dir }
}
