use std::time::Duration;

use async_trait::async_trait;

use crate::util::exception::LockResult;

pub(crate) mod codec;
pub mod engine;
pub mod metadata;
pub mod settings;
pub mod timestamp;

/// Outcome of one acquisition attempt. Neither `AnotherOwner` nor
/// `ConcurrentAttempt` is an error: both are expected under contention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttemptResult {
    Success,
    AnotherOwner(String),
    /// Somebody raced us for the same lock and the winner is not known yet.
    ConcurrentAttempt,
}

/// Storage side of a remote lock, driven by the lease manager.
#[async_trait]
pub trait RemoteLockImplementation: Send + Sync {
    fn lock_ttl(&self) -> Duration;

    fn keep_lock_alive_interval(&self) -> Duration;

    async fn try_lock(&self, lock_id: &str, owner_id: &str) -> LockResult<LockAttemptResult>;

    /// Extends a lease still held by `owner_id`. `false` means the lease is gone.
    async fn try_relock(&self, lock_id: &str, owner_id: &str) -> LockResult<bool>;

    /// `false` means there was no claim of `owner_id` left to remove.
    async fn try_unlock(&self, lock_id: &str, owner_id: &str) -> LockResult<bool>;
}
