use std::time::Duration;

use futures_retry::{ErrorHandler, RetryPolicy};
use rand::Rng;
use tracing::warn;

use super::exception::Exception;

/// Base of the short backoff used between storage attempts.
pub(crate) const SHORT_SLEEP_BASE: Duration = Duration::from_millis(50);

/// Upper bound of the long backoff used while another owner holds the lock.
pub(crate) const LONG_SLEEP_CAP: Duration = Duration::from_millis(1000);

/// Random sleep in `[0, base * e^min(attempt, 5))`.
pub(crate) fn jittered_backoff(base: Duration, attempt: usize) -> Duration {
    let exponent = attempt.min(5) as i32;
    let cap_ms = (base.as_millis() as f64 * std::f64::consts::E.powi(exponent)) as u64;
    if cap_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..cap_ms))
}

/// Random sleep in `[0, cap)`.
pub(crate) fn long_sleep(cap: Duration) -> Duration {
    let cap_ms = cap.as_millis() as u64;
    if cap_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..cap_ms))
}

/// Retries transient failures forever with jittered exponential backoff and
/// forwards everything else.
pub(crate) struct JitteredBackoffStrategy {
    base: Duration,
    context: String,
}

impl JitteredBackoffStrategy {
    pub(crate) fn new(base: Duration, context: impl Into<String>) -> Self {
        Self {
            base,
            context: context.into(),
        }
    }
}

impl ErrorHandler<Exception> for JitteredBackoffStrategy {
    type OutError = Exception;

    fn handle(&mut self, attempt: usize, e: Exception) -> RetryPolicy<Exception> {
        if !e.is_retryable() {
            return RetryPolicy::ForwardError(e);
        }

        let sleep = jittered_backoff(self.base, attempt);
        warn!(
            context = %self.context,
            attempt,
            sleep_ms = sleep.as_millis() as u64,
            error = %e,
            "Storage attempt failed, will retry"
        );
        RetryPolicy::WaitRetry(sleep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_under_cap() {
        for attempt in 0..10 {
            let cap = 50.0 * std::f64::consts::E.powi(attempt.min(5) as i32);
            for _ in 0..100 {
                let sleep = jittered_backoff(SHORT_SLEEP_BASE, attempt);
                assert!((sleep.as_millis() as f64) < cap);
            }
        }
    }

    #[test]
    fn zero_base_never_sleeps() {
        assert_eq!(jittered_backoff(Duration::from_millis(0), 3), Duration::from_millis(0));
        assert_eq!(long_sleep(Duration::from_millis(0)), Duration::from_millis(0));
    }

    #[test]
    fn non_retryable_errors_are_forwarded() {
        let mut strategy = JitteredBackoffStrategy::new(SHORT_SLEEP_BASE, "test");
        match strategy.handle(1, Exception::NonRetryable("boom".to_string())) {
            RetryPolicy::ForwardError(Exception::NonRetryable(msg)) => assert_eq!(msg, "boom"),
            _ => panic!("expected the error to be forwarded"),
        }
        match strategy.handle(1, Exception::Retryable("flaky".to_string())) {
            RetryPolicy::WaitRetry(_) => {}
            _ => panic!("expected a retry"),
        }
    }
}
