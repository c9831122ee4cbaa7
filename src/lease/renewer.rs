use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures_retry::FutureRetry;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        Mutex,
    },
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::RemoteLockState;
use crate::lock::RemoteLockImplementation;
use crate::util::{
    exception::LockResult,
    format_lock_operation_id,
    retry::{JitteredBackoffStrategy, SHORT_SLEEP_BASE},
    FreezeWatch,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RenewOutcome {
    Renewed,
    /// Storage no longer has the lease or the freeze detector gave it up.
    Lost,
    /// Released by its holder while waiting for renewal.
    Released,
}

/// Owns the keep-alive queue and the task draining it.
pub(crate) struct LeaseRenewer {
    queue: UnboundedSender<Arc<RemoteLockState>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseRenewer {
    /// Spawns the keep-alive task on the current runtime.
    pub(crate) fn start(engine: Arc<dyn RemoteLockImplementation>) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let worker = KeepAliveWorker {
            engine,
            pending,
            shutdown: shutdown.clone(),
        };
        Self {
            queue,
            shutdown,
            task: Mutex::new(Some(tokio::spawn(worker.run()))),
        }
    }

    /// Schedules the first renewal of a freshly taken lease.
    pub(crate) fn add_lease(&self, state: Arc<RemoteLockState>) {
        if let Err(rejected) = self.queue.send(state) {
            let state = rejected.0;
            warn!(
                lock_id = %state.lock_id,
                owner_id = %state.owner_id,
                "Keep-alive task is gone, the lease will not be renewed"
            );
            state.signal.fire();
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Keep-alive task failed");
            }
        }
    }
}

struct KeepAliveWorker {
    engine: Arc<dyn RemoteLockImplementation>,
    pending: UnboundedReceiver<Arc<RemoteLockState>>,
    shutdown: CancellationToken,
}

impl KeepAliveWorker {
    async fn run(mut self) {
        let keep_alive = self.engine.keep_lock_alive_interval();
        let mut due_queue: VecDeque<Arc<RemoteLockState>> = VecDeque::new();
        loop {
            while let Ok(state) = self.pending.try_recv() {
                due_queue.push_back(state);
            }
            let state = match due_queue.pop_front() {
                Some(state) => state,
                None => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    next = self.pending.recv() => match next {
                        Some(state) => state,
                        None => break,
                    },
                },
            };

            let due = state.heartbeat().await + keep_alive;
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    state.signal.fire();
                    break;
                }
                outcome = async {
                    sleep_until(due).await;
                    renew(self.engine.as_ref(), &state).await
                } => outcome,
            };
            if outcome == RenewOutcome::Renewed {
                due_queue.push_back(state);
            }
        }

        self.pending.close();
        while let Ok(state) = self.pending.try_recv() {
            due_queue.push_back(state);
        }
        for state in due_queue {
            debug!(
                lock_id = %state.lock_id,
                owner_id = %state.owner_id,
                "Keep-alive stopped, lease is no longer renewed"
            );
            state.signal.fire();
        }
    }
}

/// Renews one lease, retrying transient storage failures until the freeze
/// detector gives the lease up.
pub(crate) async fn renew(engine: &dyn RemoteLockImplementation, state: &RemoteLockState) -> RenewOutcome {
    let keep_alive = engine.keep_lock_alive_interval();
    let context = format_lock_operation_id(&state.lock_id, &state.owner_id);
    let _watch = FreezeWatch::start("KeepLockAlive", keep_alive + 2 * keep_alive, context.clone());

    let result = FutureRetry::new(
        move || relock_once(engine, state),
        JitteredBackoffStrategy::new(SHORT_SLEEP_BASE, context),
    )
    .await;
    match result {
        Ok((outcome, _attempts)) => outcome,
        Err((e, attempts)) => {
            error!(
                lock_id = %state.lock_id,
                owner_id = %state.owner_id,
                attempts,
                error = %e,
                "Failed to renew the lease"
            );
            state.surrender().await;
            RenewOutcome::Lost
        }
    }
}

/// A single renewal under the lease's own lock.
async fn relock_once(engine: &dyn RemoteLockImplementation, state: &RemoteLockState) -> LockResult<RenewOutcome> {
    let mut progress = state.progress.lock().await;
    if !progress.is_alive {
        return Ok(RenewOutcome::Released);
    }

    let silence = Instant::now().saturating_duration_since(progress.heartbeat);
    let freeze_limit = freeze_limit(engine.lock_ttl());
    if silence > freeze_limit {
        error!(
            lock_id = %state.lock_id,
            owner_id = %state.owner_id,
            elapsed_ms = silence.as_millis() as u64,
            limit_ms = freeze_limit.as_millis() as u64,
            "Lease was not renewed in time, giving it up"
        );
        progress.is_alive = false;
        state.signal.fire();
        return Ok(RenewOutcome::Lost);
    }

    let attempted_at = Instant::now();
    if engine.try_relock(&state.lock_id, &state.owner_id).await? {
        progress.heartbeat = attempted_at;
        debug!(lock_id = %state.lock_id, owner_id = %state.owner_id, "Lease renewed");
        return Ok(RenewOutcome::Renewed);
    }

    error!(
        lock_id = %state.lock_id,
        owner_id = %state.owner_id,
        "Lease is lost, storage no longer names this owner"
    );
    progress.is_alive = false;
    state.signal.fire();
    Ok(RenewOutcome::Lost)
}

/// Silence after which a lease is surrendered: half of its TTL.
fn freeze_limit(lock_ttl: Duration) -> Duration {
    lock_ttl / 2
}
