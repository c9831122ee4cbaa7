//! Column-family storage the lock algorithm runs against.
//!
//! The store is expected to behave like a wide-column database: rows of
//! columns ordered by name, last-write-wins by client timestamp, TTL on write,
//! and atomic operations per column. Nothing here spans rows.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::util::exception::LockResult;

pub mod dynamo;
pub mod memory;

/// How long a tombstone keeps shadowing older writes before it may be reaped.
pub const TOMBSTONE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub value: Bytes,
    /// Client write timestamp (microseconds) used to order conflicting writes.
    pub timestamp: i64,
}

impl Column {
    pub fn new(name: impl Into<String>, value: Bytes, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }
}

#[async_trait]
pub trait ColumnStore: Send + Sync {
    /// Live column, or `None` when it was never written, was deleted or expired.
    async fn get_column(&self, row_key: &str, column_name: &str) -> LockResult<Option<Column>>;

    /// Live columns named strictly after `exclusive_start`, ascending by name.
    async fn get_columns(
        &self,
        row_key: &str,
        exclusive_start: Option<&str>,
        limit: usize,
    ) -> LockResult<Vec<Column>>;

    /// Last-write-wins write. A write older than the stored cell is dropped.
    async fn add_column(&self, row_key: &str, column: Column, ttl: Option<Duration>) -> LockResult<()>;

    /// Last-write-wins tombstone.
    async fn delete_column(&self, row_key: &str, column_name: &str, timestamp: i64) -> LockResult<()>;

    /// Writes `column` only if the live value currently equals `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        row_key: &str,
        column: Column,
        expected: Option<&Bytes>,
        ttl: Option<Duration>,
    ) -> LockResult<bool>;
}
