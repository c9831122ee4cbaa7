use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;

pub mod handle;
pub mod manager;
mod renewer;
mod taker;

/// Whether a locker short-circuits attempts on locks it already holds itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRivalOptimization {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct LockerSettings {
    pub local_rival_optimization: LocalRivalOptimization,

    /// Whether the blocking `lock` keeps retrying transient storage failures.
    pub tolerate_storage_failures: bool,
}

impl Default for LockerSettings {
    fn default() -> Self {
        Self {
            local_rival_optimization: LocalRivalOptimization::Enabled,
            tolerate_storage_failures: true,
        }
    }
}

/// One-shot signal that fires once the lease can no longer be trusted: it was
/// lost, surrendered by the freeze detector, released, or its locker shut down.
#[derive(Debug, Clone)]
pub struct LeaseSignal {
    token: CancellationToken,
}

impl LeaseSignal {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the signal fires.
    pub async fn lost(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled together with the lease, for use in `select!` or with
    /// APIs that take a [`CancellationToken`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub(crate) fn fire(&self) {
        self.token.cancel();
    }
}

pub(crate) struct LeaseProgress {
    pub(crate) is_alive: bool,
    /// Moment of the last successful claim or renewal.
    pub(crate) heartbeat: Instant,
}

/// A lease held by this process.
pub(crate) struct RemoteLockState {
    pub(crate) lock_id: String,
    pub(crate) owner_id: String,
    /// Held for one storage call at a time by renewals and by the release.
    pub(crate) progress: Mutex<LeaseProgress>,
    pub(crate) signal: LeaseSignal,
}

impl RemoteLockState {
    pub(crate) fn new(lock_id: &str, owner_id: &str, heartbeat: Instant) -> Self {
        Self {
            lock_id: lock_id.to_string(),
            owner_id: owner_id.to_string(),
            progress: Mutex::new(LeaseProgress {
                is_alive: true,
                heartbeat,
            }),
            signal: LeaseSignal::new(),
        }
    }

    pub(crate) async fn heartbeat(&self) -> Instant {
        self.progress.lock().await.heartbeat
    }

    /// Whether the lease is alive and renewed recently enough that storage
    /// cannot have let it expire.
    pub(crate) async fn is_fresh(&self, lock_ttl: Duration) -> bool {
        let progress = self.progress.lock().await;
        progress.is_alive && Instant::now() < progress.heartbeat + lock_ttl
    }

    /// Gives the lease up locally without touching storage.
    pub(crate) async fn surrender(&self) {
        self.progress.lock().await.is_alive = false;
        self.signal.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn states_go_stale_after_lock_ttl() {
        let state = RemoteLockState::new("l", "o", Instant::now());
        assert!(state.is_fresh(Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!state.is_fresh(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn surrender_fires_the_signal_once() {
        let state = RemoteLockState::new("l", "o", Instant::now());
        let token = state.signal.cancellation_token();
        assert!(!state.signal.is_lost());

        state.surrender().await;
        state.surrender().await;
        assert!(state.signal.is_lost());
        assert!(token.is_cancelled());
        state.signal.lost().await;
        assert!(!state.is_fresh(Duration::from_secs(60)).await);
    }
}
