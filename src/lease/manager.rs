use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{
    handle::LockHandle,
    renewer::LeaseRenewer,
    taker::{LeaseTaker, TakeOutcome},
    LockerSettings, RemoteLockState,
};
use crate::lock::{
    engine::{validate_lock_id, LockEngine},
    settings::LockSettings,
    RemoteLockImplementation,
};
use crate::storage::ColumnStore;
use crate::util::{
    exception::{Exception, LockResult},
    format_lock_operation_id,
    retry::{jittered_backoff, long_sleep, LONG_SLEEP_CAP, SHORT_SLEEP_BASE},
    FreezeWatch,
};

/// Anything that hands out remote locks.
#[async_trait]
pub trait RemoteLockCreator: Send + Sync {
    /// Waits until the lock is acquired.
    async fn lock(&self, lock_id: &str) -> LockResult<LockHandle>;

    /// Single attempt. `None` means somebody else holds the lock.
    async fn try_get_lock(&self, lock_id: &str) -> LockResult<Option<LockHandle>>;
}

/// Process-wide broker of remote locks: takes leases, keeps them alive in the
/// background and releases them.
///
/// Must be created inside a tokio runtime, which runs the keep-alive task.
/// Clones share the same leases and keep-alive task.
#[derive(Clone)]
pub struct LeaseManager {
    engine: Arc<dyn RemoteLockImplementation>,
    settings: LockerSettings,
    states: Arc<DashMap<String, Arc<RemoteLockState>>>,
    lease_taker: Arc<LeaseTaker>,
    lease_renewer: Arc<LeaseRenewer>,
    disposed: Arc<AtomicBool>,
}

impl LeaseManager {
    pub fn new(engine: Arc<dyn RemoteLockImplementation>, settings: LockerSettings) -> Self {
        let states = Arc::new(DashMap::new());
        Self {
            lease_taker: Arc::new(LeaseTaker::new(engine.clone(), states.clone(), settings.clone())),
            lease_renewer: Arc::new(LeaseRenewer::start(engine.clone())),
            engine,
            settings,
            states,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Locker over the built-in [`LockEngine`].
    pub fn with_store(
        store: Arc<dyn ColumnStore>,
        lock_settings: LockSettings,
        locker_settings: LockerSettings,
    ) -> Self {
        Self::new(Arc::new(LockEngine::new(store, lock_settings)), locker_settings)
    }

    pub fn settings(&self) -> &LockerSettings {
        &self.settings
    }

    /// Lock ids currently held through this locker.
    pub fn held_lock_ids(&self) -> Vec<String> {
        self.states.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stops renewing leases. Leases of outstanding handles are not released
    /// in storage; their signals fire and they expire by TTL unless released.
    pub async fn shutdown(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.lease_renewer.shutdown().await;
        debug!("Locker shut down");
    }

    fn ensure_running(&self) -> LockResult<()> {
        if self.is_disposed() {
            return Err(Exception::Disposed);
        }
        Ok(())
    }

    fn slow_operation_threshold(&self) -> Duration {
        2 * self.engine.keep_lock_alive_interval()
    }

    fn hand_out(&self, state: Arc<RemoteLockState>) -> LockHandle {
        self.lease_renewer.add_lease(state.clone());
        LockHandle::new(state, self.clone())
    }

    pub(crate) async fn release(&self, state: &Arc<RemoteLockState>) -> LockResult<()> {
        let context = format_lock_operation_id(&state.lock_id, &state.owner_id);
        let _watch = FreezeWatch::start("ReleaseLock", self.slow_operation_threshold(), context);

        let removed = self
            .states
            .remove_if(&state.lock_id, |_, held| held.owner_id == state.owner_id)
            .is_some();

        let mut progress = state.progress.lock().await;
        let was_alive = progress.is_alive;
        progress.is_alive = false;
        state.signal.fire();

        match self.engine.try_unlock(&state.lock_id, &state.owner_id).await {
            Ok(true) => debug!(lock_id = %state.lock_id, owner_id = %state.owner_id, "Lock released"),
            Ok(false) => warn!(
                lock_id = %state.lock_id,
                owner_id = %state.owner_id,
                "Lock was already gone from storage when released"
            ),
            Err(e) => error!(
                lock_id = %state.lock_id,
                owner_id = %state.owner_id,
                error = %e,
                "Failed to unlock, the lease will expire by TTL"
            ),
        }

        if !removed && was_alive {
            return Err(Exception::CorruptedState {
                lock_id: state.lock_id.clone(),
                owner_id: state.owner_id.clone(),
                details: "released lock is not registered as held".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteLockCreator for LeaseManager {
    async fn lock(&self, lock_id: &str) -> LockResult<LockHandle> {
        self.ensure_running()?;
        validate_lock_id(lock_id)?;

        let owner_id = Uuid::new_v4().to_string();
        let context = format_lock_operation_id(lock_id, &owner_id);
        let _watch = FreezeWatch::start("Lock", self.slow_operation_threshold(), context);

        let mut failures = 0;
        loop {
            let pause = match self.lease_taker.take(lock_id, &owner_id).await {
                Ok(TakeOutcome::Taken(state)) => return Ok(self.hand_out(state)),
                Ok(TakeOutcome::HeldLocally) => long_sleep(LONG_SLEEP_CAP),
                Ok(TakeOutcome::HeldBy(holder)) => {
                    let pause = long_sleep(LONG_SLEEP_CAP);
                    debug!(
                        lock_id,
                        owner_id = %owner_id,
                        holder = %holder,
                        sleep_ms = pause.as_millis() as u64,
                        "Lock is held by another owner"
                    );
                    pause
                }
                Err(e) if e.is_retryable() && self.settings.tolerate_storage_failures => {
                    failures += 1;
                    let pause = jittered_backoff(SHORT_SLEEP_BASE, failures);
                    warn!(
                        lock_id,
                        owner_id = %owner_id,
                        attempt = failures,
                        sleep_ms = pause.as_millis() as u64,
                        error = %e,
                        "Storage failure while taking the lock, will retry"
                    );
                    pause
                }
                Err(e) => return Err(e),
            };
            sleep(pause).await;
            self.ensure_running()?;
        }
    }

    async fn try_get_lock(&self, lock_id: &str) -> LockResult<Option<LockHandle>> {
        self.ensure_running()?;
        validate_lock_id(lock_id)?;

        let owner_id = Uuid::new_v4().to_string();
        let context = format_lock_operation_id(lock_id, &owner_id);
        let _watch = FreezeWatch::start("TryGetLock", self.slow_operation_threshold(), context);

        match self.lease_taker.take(lock_id, &owner_id).await? {
            TakeOutcome::Taken(state) => Ok(Some(self.hand_out(state))),
            TakeOutcome::HeldLocally => {
                debug!(lock_id, "Lock is held by this process");
                Ok(None)
            }
            TakeOutcome::HeldBy(holder) => {
                debug!(lock_id, holder = %holder, "Lock is held by another owner");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LocalRivalOptimization;
    use crate::storage::memory::MemoryColumnStore;
    use crate::testing::FlakyColumnStore;

    fn locker(store: &MemoryColumnStore) -> LeaseManager {
        LeaseManager::with_store(
            Arc::new(store.clone()),
            LockSettings::default(),
            LockerSettings::default(),
        )
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let locker = locker(&MemoryColumnStore::new());
        let handle = locker.try_get_lock("l").await.unwrap().unwrap();
        assert_eq!(locker.held_lock_ids(), vec!["l"]);

        handle.release().await.unwrap();
        handle.release().await.unwrap();
        assert!(handle.is_lost());
        assert!(locker.held_lock_ids().is_empty());
        assert!(locker.try_get_lock("l").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_lock_ids_are_rejected() {
        let locker = locker(&MemoryColumnStore::new());
        assert!(matches!(locker.try_get_lock("").await, Err(Exception::InvalidArgument(_))));
        assert!(matches!(locker.lock("").await, Err(Exception::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn owner_tokens_are_fresh_per_acquisition() {
        let locker = locker(&MemoryColumnStore::new());
        let first = locker.lock("l").await.unwrap();
        let first_owner = first.owner_id().to_string();
        first.release().await.unwrap();

        let second = locker.lock("l").await.unwrap();
        assert_ne!(second.owner_id(), first_owner);
        assert_eq!(second.lock_id(), "l");
    }

    #[tokio::test]
    async fn dropped_handles_are_released() {
        let store = MemoryColumnStore::new();
        let locker = locker(&store);
        let other = LeaseManager::with_store(
            Arc::new(store.clone()),
            LockSettings::default(),
            LockerSettings {
                local_rival_optimization: LocalRivalOptimization::Disabled,
                ..LockerSettings::default()
            },
        );

        let handle = locker.try_get_lock("l").await.unwrap().unwrap();
        assert!(other.try_get_lock("l").await.unwrap().is_none());
        drop(handle);

        let mut taken = None;
        for _ in 0..100 {
            tokio::task::yield_now().await;
            taken = other.try_get_lock("l").await.unwrap();
            if taken.is_some() {
                break;
            }
        }
        assert!(taken.is_some());
        assert!(locker.held_lock_ids().is_empty());
    }

    fn locker_over_failing_store(tolerate_storage_failures: bool) -> LeaseManager {
        let store = FlakyColumnStore::new(Arc::new(MemoryColumnStore::new()), 1.0);
        LeaseManager::with_store(
            Arc::new(store),
            LockSettings::default(),
            LockerSettings {
                tolerate_storage_failures,
                ..LockerSettings::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failures_propagate_when_not_tolerated() {
        let locker = locker_over_failing_store(false);
        assert!(matches!(locker.lock("l").await, Err(Exception::Retryable(_))));
        assert!(matches!(locker.try_get_lock("l").await, Err(Exception::Retryable(_))));
        assert!(locker.held_lock_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tolerated_storage_failures_keep_lock_waiting() {
        let locker = locker_over_failing_store(true);
        assert!(matches!(locker.try_get_lock("l").await, Err(Exception::Retryable(_))));

        let waiting = tokio::spawn({
            let locker = locker.clone();
            async move { locker.lock("l").await }
        });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!waiting.is_finished());
        waiting.abort();
    }

    #[tokio::test]
    async fn disposed_lockers_refuse_work() {
        let locker = locker(&MemoryColumnStore::new());
        let handle = locker.lock("l").await.unwrap();

        locker.shutdown().await;
        locker.shutdown().await;
        assert!(locker.is_disposed());
        assert!(handle.is_lost());
        assert_eq!(locker.try_get_lock("m").await.unwrap_err(), Exception::Disposed);
        assert_eq!(locker.lock("m").await.unwrap_err(), Exception::Disposed);

        // Handles can still be released after shutdown.
        handle.release().await.unwrap();
        assert!(locker.held_lock_ids().is_empty());
    }
}
