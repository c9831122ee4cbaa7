//! Fault injection for exercising lockers against hostile conditions.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;

use crate::lock::timestamp::{SystemTimestampProvider, TimestampProvider};
use crate::storage::{Column, ColumnStore};
use crate::util::exception::{Exception, LockResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSkew {
    None,
    OnlyPositive,
    PositiveAndNegative,
}

/// Clock of a machine whose time drifts by up to `max_skew` in every reading.
pub struct SkewedTimestampProvider {
    inner: SystemTimestampProvider,
    skew: ClockSkew,
    max_skew_micros: i64,
}

impl SkewedTimestampProvider {
    pub fn new(skew: ClockSkew, max_skew: Duration) -> Self {
        Self {
            inner: SystemTimestampProvider::new(),
            skew,
            max_skew_micros: max_skew.as_micros().min(i64::MAX as u128) as i64,
        }
    }
}

impl TimestampProvider for SkewedTimestampProvider {
    fn now_ticks(&self) -> i64 {
        let now = self.inner.now_ticks();
        if self.max_skew_micros == 0 {
            return now;
        }
        let mut rng = rand::thread_rng();
        let drift = match self.skew {
            ClockSkew::None => 0,
            ClockSkew::OnlyPositive => rng.gen_range(0..=self.max_skew_micros),
            ClockSkew::PositiveAndNegative => rng.gen_range(-self.max_skew_micros..=self.max_skew_micros),
        };
        now.saturating_add(drift)
    }
}

/// Store whose every call may fail before reaching the inner store, or after
/// the inner store already applied it.
pub struct FlakyColumnStore {
    inner: Arc<dyn ColumnStore>,
    failure_probability: f64,
    injected_failures: AtomicU64,
}

impl FlakyColumnStore {
    pub fn new(inner: Arc<dyn ColumnStore>, failure_probability: f64) -> Self {
        Self {
            inner,
            failure_probability: failure_probability.clamp(0.0, 1.0),
            injected_failures: AtomicU64::new(0),
        }
    }

    pub fn injected_failures(&self) -> u64 {
        self.injected_failures.load(Ordering::Relaxed)
    }

    fn maybe_fail(&self, operation: &str, stage: &str) -> LockResult<()> {
        if rand::thread_rng().gen_bool(self.failure_probability) {
            self.injected_failures.fetch_add(1, Ordering::Relaxed);
            return Err(Exception::Retryable(format!("Injected failure {} {}", stage, operation)));
        }
        Ok(())
    }

    fn before(&self, operation: &str) -> LockResult<()> {
        self.maybe_fail(operation, "before")
    }

    fn after<T>(&self, operation: &str, result: LockResult<T>) -> LockResult<T> {
        let value = result?;
        self.maybe_fail(operation, "after")?;
        Ok(value)
    }
}

#[async_trait]
impl ColumnStore for FlakyColumnStore {
    async fn get_column(&self, row_key: &str, column_name: &str) -> LockResult<Option<Column>> {
        self.before("get_column")?;
        let result = self.inner.get_column(row_key, column_name).await;
        self.after("get_column", result)
    }

    async fn get_columns(
        &self,
        row_key: &str,
        exclusive_start: Option<&str>,
        limit: usize,
    ) -> LockResult<Vec<Column>> {
        self.before("get_columns")?;
        let result = self.inner.get_columns(row_key, exclusive_start, limit).await;
        self.after("get_columns", result)
    }

    async fn add_column(&self, row_key: &str, column: Column, ttl: Option<Duration>) -> LockResult<()> {
        self.before("add_column")?;
        let result = self.inner.add_column(row_key, column, ttl).await;
        self.after("add_column", result)
    }

    async fn delete_column(&self, row_key: &str, column_name: &str, timestamp: i64) -> LockResult<()> {
        self.before("delete_column")?;
        let result = self.inner.delete_column(row_key, column_name, timestamp).await;
        self.after("delete_column", result)
    }

    async fn compare_and_set(
        &self,
        row_key: &str,
        column: Column,
        expected: Option<&Bytes>,
        ttl: Option<Duration>,
    ) -> LockResult<bool> {
        self.before("compare_and_set")?;
        let result = self.inner.compare_and_set(row_key, column, expected, ttl).await;
        self.after("compare_and_set", result)
    }
}
