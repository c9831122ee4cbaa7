use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::runtime::Handle;
use tracing::{error, warn};

use super::{manager::LeaseManager, LeaseSignal, RemoteLockState};
use crate::util::exception::LockResult;

/// A held lock. Release it with [`LockHandle::release`]; a handle that is
/// dropped unreleased is released in the background.
pub struct LockHandle {
    state: Arc<RemoteLockState>,
    manager: LeaseManager,
    released: AtomicBool,
}

impl LockHandle {
    pub(crate) fn new(state: Arc<RemoteLockState>, manager: LeaseManager) -> Self {
        Self {
            state,
            manager,
            released: AtomicBool::new(false),
        }
    }

    pub fn lock_id(&self) -> &str {
        &self.state.lock_id
    }

    /// Owner token minted for this acquisition.
    pub fn owner_id(&self) -> &str {
        &self.state.owner_id
    }

    pub fn signal(&self) -> &LeaseSignal {
        &self.state.signal
    }

    pub fn is_lost(&self) -> bool {
        self.state.signal.is_lost()
    }

    /// Releases the lock. Only the first call does anything.
    pub async fn release(&self) -> LockResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.manager.release(&self.state).await
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match Handle::try_current() {
            Ok(runtime) => {
                let state = self.state.clone();
                let manager = self.manager.clone();
                runtime.spawn(async move {
                    if let Err(e) = manager.release(&state).await {
                        error!(
                            lock_id = %state.lock_id,
                            owner_id = %state.owner_id,
                            error = %e,
                            "Failed to release a dropped lock handle"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    lock_id = %self.state.lock_id,
                    owner_id = %self.state.owner_id,
                    "Lock handle dropped outside of a runtime, the lease will expire by TTL"
                );
                self.state.signal.fire();
            }
        }
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock_id", &self.state.lock_id)
            .field("owner_id", &self.state.owner_id)
            .field("lost", &self.state.signal.is_lost())
            .finish()
    }
}
