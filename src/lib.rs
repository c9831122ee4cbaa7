//! Lease-based distributed locks over an eventually consistent column store.
//!
//! A [`LeaseManager`] takes locks through a [`lock::engine::LockEngine`],
//! renews them in the background and fires the [`LeaseSignal`] of a lock as
//! soon as it can no longer be trusted to be held.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use remote_lock::{
//!     lock::settings::LockSettings, storage::memory::MemoryColumnStore, LeaseManager, LockerSettings,
//!     RemoteLockCreator,
//! };
//!
//! # async fn run() -> remote_lock::LockResult<()> {
//! let locker = LeaseManager::with_store(
//!     Arc::new(MemoryColumnStore::new()),
//!     LockSettings::default(),
//!     LockerSettings::default(),
//! );
//! let handle = locker.lock("orders").await?;
//! tokio::select! {
//!     _ = handle.signal().lost() => {}
//!     _ = async { /* critical section */ } => {}
//! }
//! handle.release().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod lease;
pub mod lock;
pub mod storage;
pub mod testing;
mod util;

pub use config::RemoteLockConfig;
pub use lease::{
    handle::LockHandle,
    manager::{LeaseManager, RemoteLockCreator},
    LeaseSignal, LocalRivalOptimization, LockerSettings,
};
pub use lock::{LockAttemptResult, RemoteLockImplementation};
pub use util::exception::{Exception, LockResult};
