use std::{fmt, sync::Arc, time::Duration};

use tracing::warn;

use super::timestamp::{SystemTimestampProvider, TimestampProvider};
use crate::util::exception::{Exception, LockResult};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_LOCK_METADATA_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_KEEP_LOCK_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CHANGE_LOCK_ROW_THRESHOLD: u32 = 1000;

/// Options of the storage-backed lock algorithm.
#[derive(Clone)]
pub struct LockSettings {
    pub(crate) timestamp_provider: Arc<dyn TimestampProvider>,
    pub(crate) lock_ttl: Duration,
    pub(crate) lock_metadata_ttl: Duration,
    pub(crate) keep_lock_alive_interval: Duration,
    pub(crate) change_lock_row_threshold: u32,
}

impl LockSettings {
    pub fn new(
        timestamp_provider: Arc<dyn TimestampProvider>,
        lock_ttl: Duration,
        lock_metadata_ttl: Duration,
        keep_lock_alive_interval: Duration,
        change_lock_row_threshold: u32,
    ) -> LockResult<Self> {
        if change_lock_row_threshold == 0 {
            return Err(Exception::InvalidArgument(
                "ChangeLockRowThreshold must be positive integer".to_string(),
            ));
        }
        if lock_ttl.is_zero() {
            return Err(Exception::InvalidArgument("LockTtl must be positive".to_string()));
        }
        if lock_metadata_ttl < lock_ttl {
            return Err(Exception::InvalidArgument(format!(
                "LockMetadataTtl ({:?}) must not be shorter than LockTtl ({:?})",
                lock_metadata_ttl, lock_ttl
            )));
        }
        if keep_lock_alive_interval >= lock_metadata_ttl {
            return Err(Exception::InvalidArgument(format!(
                "KeepLockAliveInterval ({:?}) must be shorter than LockMetadataTtl ({:?})",
                keep_lock_alive_interval, lock_metadata_ttl
            )));
        }
        if keep_lock_alive_interval > lock_ttl / 3 {
            warn!(
                keep_lock_alive_interval_ms = keep_lock_alive_interval.as_millis() as u64,
                lock_ttl_ms = lock_ttl.as_millis() as u64,
                "KeepLockAliveInterval is above a third of LockTtl, leases may be lost between renewals"
            );
        }

        Ok(Self {
            timestamp_provider,
            lock_ttl,
            lock_metadata_ttl,
            keep_lock_alive_interval,
            change_lock_row_threshold,
        })
    }

    pub fn with_timestamp_provider(mut self, timestamp_provider: Arc<dyn TimestampProvider>) -> Self {
        self.timestamp_provider = timestamp_provider;
        self
    }

    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    pub fn lock_metadata_ttl(&self) -> Duration {
        self.lock_metadata_ttl
    }

    pub fn keep_lock_alive_interval(&self) -> Duration {
        self.keep_lock_alive_interval
    }

    pub fn change_lock_row_threshold(&self) -> u32 {
        self.change_lock_row_threshold
    }

    pub fn timestamp_provider(&self) -> &Arc<dyn TimestampProvider> {
        &self.timestamp_provider
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timestamp_provider: Arc::new(SystemTimestampProvider::new()),
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_metadata_ttl: DEFAULT_LOCK_METADATA_TTL,
            keep_lock_alive_interval: DEFAULT_KEEP_LOCK_ALIVE_INTERVAL,
            change_lock_row_threshold: DEFAULT_CHANGE_LOCK_ROW_THRESHOLD,
        }
    }
}

impl fmt::Debug for LockSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockSettings")
            .field("lock_ttl", &self.lock_ttl)
            .field("lock_metadata_ttl", &self.lock_metadata_ttl)
            .field("keep_lock_alive_interval", &self.keep_lock_alive_interval)
            .field("change_lock_row_threshold", &self.change_lock_row_threshold)
            .finish()
    }
}
