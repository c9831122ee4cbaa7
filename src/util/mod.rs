use std::time::Duration;

use tokio::time::Instant;
use tracing::error;

pub(crate) mod exception;
pub(crate) mod retry;

/// Reports an operation that outlived its warning threshold once it completes.
///
/// Lease operations that take this long are a sign that the process (or the
/// storage) froze for a while, which is exactly when lease overlaps happen.
pub(crate) struct FreezeWatch {
    operation: &'static str,
    context: String,
    threshold: Duration,
    started: Instant,
}

impl FreezeWatch {
    pub(crate) fn start(operation: &'static str, threshold: Duration, context: String) -> Self {
        Self {
            operation,
            context,
            threshold,
            started: Instant::now(),
        }
    }
}

impl Drop for FreezeWatch {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        if elapsed < self.threshold {
            return;
        }
        error!(
            operation = self.operation,
            elapsed_ms = elapsed.as_millis() as u64,
            "{}() took too long for {}",
            self.operation,
            self.context
        );
    }
}

pub(crate) fn format_lock_operation_id(lock_id: &str, owner_id: &str) -> String {
    format!("lockId: {}, ownerId: {}", lock_id, owner_id)
}
