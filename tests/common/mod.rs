//! Shared setup for the locker scenarios.

use std::{sync::Arc, time::Duration};

use remote_lock::{
    lock::{
        engine::LockEngine,
        settings::LockSettings,
        timestamp::SystemTimestampProvider,
    },
    storage::ColumnStore,
    LeaseManager, LocalRivalOptimization, LockerSettings,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
pub fn lock_settings(lock_ttl: Duration, keep_lock_alive_interval: Duration) -> LockSettings {
    lock_settings_with_row_threshold(lock_ttl, keep_lock_alive_interval, 1000)
}

#[allow(dead_code)]
pub fn lock_settings_with_row_threshold(
    lock_ttl: Duration,
    keep_lock_alive_interval: Duration,
    change_lock_row_threshold: u32,
) -> LockSettings {
    LockSettings::new(
        Arc::new(SystemTimestampProvider::new()),
        lock_ttl,
        Duration::from_secs(600),
        keep_lock_alive_interval,
        change_lock_row_threshold,
    )
    .unwrap()
}

pub fn locker(
    store: Arc<dyn ColumnStore>,
    settings: LockSettings,
    local_rival_optimization: LocalRivalOptimization,
) -> LeaseManager {
    LeaseManager::with_store(
        store,
        settings,
        LockerSettings {
            local_rival_optimization,
            tolerate_storage_failures: true,
        },
    )
}

/// Engine over the same rows, for looking at what storage holds.
#[allow(dead_code)]
pub fn inspector(store: Arc<dyn ColumnStore>) -> LockEngine {
    LockEngine::new(store, lock_settings(Duration::from_secs(10), Duration::from_secs(2)))
}
