use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::{LocalRivalOptimization, LockerSettings, RemoteLockState};
use crate::lock::{LockAttemptResult, RemoteLockImplementation};
use crate::util::{
    exception::{Exception, LockResult},
    retry::{jittered_backoff, SHORT_SLEEP_BASE},
};

pub(crate) enum TakeOutcome {
    Taken(Arc<RemoteLockState>),
    /// Another caller of this process holds the lock.
    HeldLocally,
    HeldBy(String),
}

/// Runs acquisition attempts against storage and records won leases in the
/// local lock map.
pub(crate) struct LeaseTaker {
    engine: Arc<dyn RemoteLockImplementation>,
    states: Arc<DashMap<String, Arc<RemoteLockState>>>,
    settings: LockerSettings,
}

impl LeaseTaker {
    pub(crate) fn new(
        engine: Arc<dyn RemoteLockImplementation>,
        states: Arc<DashMap<String, Arc<RemoteLockState>>>,
        settings: LockerSettings,
    ) -> Self {
        Self {
            engine,
            states,
            settings,
        }
    }

    fn held_locally(&self, lock_id: &str) -> bool {
        self.settings.local_rival_optimization == LocalRivalOptimization::Enabled
            && self
                .states
                .get(lock_id)
                .map_or(false, |state| !state.signal.is_lost())
    }

    /// One acquisition attempt. Races with other candidates are retried here;
    /// a lock held by anybody else is reported back.
    pub(crate) async fn take(&self, lock_id: &str, owner_id: &str) -> LockResult<TakeOutcome> {
        let mut attempt = 0;
        loop {
            if self.held_locally(lock_id) {
                return Ok(TakeOutcome::HeldLocally);
            }

            // Renewal deadlines count from before the claim reached storage.
            let heartbeat = Instant::now();
            match self.engine.try_lock(lock_id, owner_id).await? {
                LockAttemptResult::Success => {
                    let state = Arc::new(RemoteLockState::new(lock_id, owner_id, heartbeat));
                    self.register(state.clone()).await?;
                    debug!(lock_id, owner_id, "Lock acquired");
                    return Ok(TakeOutcome::Taken(state));
                }
                LockAttemptResult::AnotherOwner(owner) => return Ok(TakeOutcome::HeldBy(owner)),
                LockAttemptResult::ConcurrentAttempt => {
                    attempt += 1;
                    let pause = jittered_backoff(SHORT_SLEEP_BASE, attempt);
                    debug!(
                        lock_id,
                        owner_id,
                        attempt,
                        sleep_ms = pause.as_millis() as u64,
                        "Concurrent attempt to take the lock"
                    );
                    sleep(pause).await;
                }
            }
        }
    }

    async fn register(&self, state: Arc<RemoteLockState>) -> LockResult<()> {
        let existing = self.states.get(&state.lock_id).map(|entry| entry.value().clone());
        if let Some(existing) = existing {
            if existing.is_fresh(self.engine.lock_ttl()).await {
                return Err(self.refuse(&state, &existing).await);
            }
            existing.surrender().await;
            warn!(
                lock_id = %state.lock_id,
                owner_id = %state.owner_id,
                previous_owner_id = %existing.owner_id,
                "Replacing an expired lease that was never released"
            );
        }

        let conflict = match self.states.entry(state.lock_id.clone()) {
            Entry::Occupied(mut entry) if entry.get().signal.is_lost() => {
                entry.insert(state.clone());
                None
            }
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(state.clone());
                None
            }
        };
        match conflict {
            Some(existing) => Err(self.refuse(&state, &existing).await),
            None => Ok(()),
        }
    }

    /// Gives back a claim won in storage for a lock this process already
    /// holds under another owner.
    async fn refuse(&self, state: &RemoteLockState, existing: &RemoteLockState) -> Exception {
        if existing.owner_id != state.owner_id {
            match self.engine.try_unlock(&state.lock_id, &state.owner_id).await {
                Ok(_) => debug!(lock_id = %state.lock_id, owner_id = %state.owner_id, "Unwanted claim released"),
                Err(e) => warn!(
                    lock_id = %state.lock_id,
                    owner_id = %state.owner_id,
                    error = %e,
                    "Failed to release an unwanted claim, it will expire by TTL"
                ),
            }
        }
        corrupted(state, existing)
    }
}

fn corrupted(state: &RemoteLockState, existing: &RemoteLockState) -> Exception {
    Exception::CorruptedState {
        lock_id: state.lock_id.clone(),
        owner_id: state.owner_id.clone(),
        details: format!("lock is already held locally by ownerId: {}", existing.owner_id),
    }
}
