use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Source of the write timestamps handed to the column store.
///
/// Ticks are microseconds since the UNIX epoch, the resolution the store uses
/// to order conflicting writes.
pub trait TimestampProvider: Send + Sync {
    fn now_ticks(&self) -> i64;
}

/// Wall clock that never hands out the same tick twice within a process.
#[derive(Debug, Default)]
pub struct SystemTimestampProvider {
    last: AtomicI64,
}

impl SystemTimestampProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimestampProvider for SystemTimestampProvider {
    fn now_ticks(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}
