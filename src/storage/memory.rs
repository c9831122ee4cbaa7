//! In-memory column store.
//!
//! Keeps the semantics the lock algorithm relies on (ordered columns,
//! last-write-wins, TTL, tombstones) for tests and single-process use.
//! Expiry runs on the tokio clock, so paused-time tests see leases expire.
//! Expired cells are dropped from a row whenever it is written, and
//! tombstones expire after [`TOMBSTONE_RETENTION`].

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{sync::RwLock, time::Instant};

use super::{Column, ColumnStore, TOMBSTONE_RETENTION};
use crate::util::exception::LockResult;

#[derive(Debug, Clone)]
struct Cell {
    /// `None` marks a tombstone.
    value: Option<Bytes>,
    timestamp: i64,
    expires_at: Option<Instant>,
}

impl Cell {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    fn live_value(&self, now: Instant) -> Option<&Bytes> {
        if self.is_expired(now) {
            None
        } else {
            self.value.as_ref()
        }
    }

    /// Whether a write stamped `timestamp` wins against this cell.
    fn yields_to(&self, timestamp: i64, is_tombstone: bool, now: Instant) -> bool {
        if self.is_expired(now) || timestamp > self.timestamp {
            return true;
        }
        timestamp == self.timestamp && is_tombstone && self.value.is_some()
    }
}

#[derive(Clone)]
pub struct MemoryColumnStore {
    rows: Arc<RwLock<HashMap<String, BTreeMap<String, Cell>>>>,
    tombstone_retention: Duration,
}

impl Default for MemoryColumnStore {
    fn default() -> Self {
        Self {
            rows: Arc::default(),
            tombstone_retention: TOMBSTONE_RETENTION,
        }
    }
}

impl MemoryColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tombstone_retention(tombstone_retention: Duration) -> Self {
        Self {
            tombstone_retention,
            ..Self::default()
        }
    }

    async fn write(&self, row_key: &str, column_name: String, cell: Cell) {
        let now = Instant::now();
        let mut rows = self.rows.write().await;
        let row = live_row(&mut rows, row_key, now);
        let accept = match row.get(&column_name) {
            Some(existing) => existing.yields_to(cell.timestamp, cell.value.is_none(), now),
            None => true,
        };
        if accept {
            row.insert(column_name, cell);
        }
    }
}

/// Row `row_key` with its dead cells dropped.
fn live_row<'a>(
    rows: &'a mut HashMap<String, BTreeMap<String, Cell>>,
    row_key: &str,
    now: Instant,
) -> &'a mut BTreeMap<String, Cell> {
    let row = rows.entry(row_key.to_string()).or_default();
    row.retain(|_, cell| !cell.is_expired(now));
    row
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl ColumnStore for MemoryColumnStore {
    async fn get_column(&self, row_key: &str, column_name: &str) -> LockResult<Option<Column>> {
        let now = Instant::now();
        let rows = self.rows.read().await;
        Ok(rows
            .get(row_key)
            .and_then(|row| row.get(column_name))
            .and_then(|cell| {
                cell.live_value(now)
                    .map(|value| Column::new(column_name, value.clone(), cell.timestamp))
            }))
    }

    async fn get_columns(
        &self,
        row_key: &str,
        exclusive_start: Option<&str>,
        limit: usize,
    ) -> LockResult<Vec<Column>> {
        let now = Instant::now();
        let rows = self.rows.read().await;
        let row = match rows.get(row_key) {
            Some(row) => row,
            None => return Ok(Vec::new()),
        };
        let lower = match exclusive_start {
            Some(start) => Bound::Excluded(start),
            None => Bound::Unbounded,
        };
        Ok(row
            .range::<str, _>((lower, Bound::Unbounded))
            .filter_map(|(name, cell)| {
                cell.live_value(now)
                    .map(|value| Column::new(name.clone(), value.clone(), cell.timestamp))
            })
            .take(limit)
            .collect())
    }

    async fn add_column(&self, row_key: &str, column: Column, ttl: Option<Duration>) -> LockResult<()> {
        let cell = Cell {
            value: Some(column.value),
            timestamp: column.timestamp,
            expires_at: expiry(ttl),
        };
        self.write(row_key, column.name, cell).await;
        Ok(())
    }

    async fn delete_column(&self, row_key: &str, column_name: &str, timestamp: i64) -> LockResult<()> {
        let cell = Cell {
            value: None,
            timestamp,
            expires_at: expiry(Some(self.tombstone_retention)),
        };
        self.write(row_key, column_name.to_string(), cell).await;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        row_key: &str,
        column: Column,
        expected: Option<&Bytes>,
        ttl: Option<Duration>,
    ) -> LockResult<bool> {
        let now = Instant::now();
        let mut rows = self.rows.write().await;
        let row = live_row(&mut rows, row_key, now);
        let existing = row.get(&column.name);
        let current = existing.and_then(|cell| cell.live_value(now));
        if current != expected {
            return Ok(false);
        }

        // The swap is authoritative, so it must also win the timestamp order.
        let timestamp = match existing {
            Some(cell) if cell.timestamp >= column.timestamp => cell.timestamp + 1,
            _ => column.timestamp,
        };
        row.insert(
            column.name,
            Cell {
                value: Some(column.value),
                timestamp,
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, value: &'static str, timestamp: i64) -> Column {
        Column::new(name, Bytes::from_static(value.as_bytes()), timestamp)
    }

    #[tokio::test]
    async fn older_writes_lose() {
        let store = MemoryColumnStore::new();
        store.add_column("r", column("c", "new", 10), None).await.unwrap();
        store.add_column("r", column("c", "old", 5), None).await.unwrap();
        let read = store.get_column("r", "c").await.unwrap().unwrap();
        assert_eq!(read.value, Bytes::from_static(b"new"));
        assert_eq!(read.timestamp, 10);
    }

    #[tokio::test]
    async fn tombstones_shadow_older_writes() {
        let store = MemoryColumnStore::new();
        store.add_column("r", column("c", "v", 10), None).await.unwrap();
        store.delete_column("r", "c", 10).await.unwrap();
        assert_eq!(store.get_column("r", "c").await.unwrap(), None);

        store.add_column("r", column("c", "late", 9), None).await.unwrap();
        assert_eq!(store.get_column("r", "c").await.unwrap(), None);

        store.add_column("r", column("c", "newer", 11), None).await.unwrap();
        assert!(store.get_column("r", "c").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn columns_expire_after_ttl() {
        let store = MemoryColumnStore::new();
        store
            .add_column("r", column("c", "v", 1), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.get_column("r", "c").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.get_column("r", "c").await.unwrap(), None);

        // An expired cell does not block older timestamps.
        store.add_column("r", column("c", "again", 0), None).await.unwrap();
        assert!(store.get_column("r", "c").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dead_cells_are_dropped_on_write() {
        let store = MemoryColumnStore::with_tombstone_retention(Duration::from_secs(30));
        store
            .add_column("r", column("claim", "v", 1), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        store.add_column("r", column("gone", "v", 1), None).await.unwrap();
        store.delete_column("r", "gone", 2).await.unwrap();
        assert_eq!(store.rows.read().await["r"].len(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        store.add_column("r", column("next", "v", 3), None).await.unwrap();
        let names: Vec<String> = store.rows.read().await["r"].keys().cloned().collect();
        assert_eq!(names, vec!["gone", "next"]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        store.delete_column("r", "next", 4).await.unwrap();
        let names: Vec<String> = store.rows.read().await["r"].keys().cloned().collect();
        assert_eq!(names, vec!["next"]);
    }

    #[tokio::test]
    async fn range_reads_start_after_cursor_and_skip_dead_columns() {
        let store = MemoryColumnStore::new();
        for (name, ts) in [("a", 1), ("b", 1), ("c", 1), ("d", 1)] {
            store.add_column("r", column(name, "v", ts), None).await.unwrap();
        }
        store.delete_column("r", "c", 2).await.unwrap();

        let names = |columns: Vec<Column>| columns.into_iter().map(|c| c.name).collect::<Vec<_>>();
        assert_eq!(names(store.get_columns("r", None, 10).await.unwrap()), vec!["a", "b", "d"]);
        assert_eq!(names(store.get_columns("r", Some("a"), 10).await.unwrap()), vec!["b", "d"]);
        assert_eq!(names(store.get_columns("r", Some("a"), 1).await.unwrap()), vec!["b"]);
        assert!(store.get_columns("missing", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compare_and_set_checks_current_value() {
        let store = MemoryColumnStore::new();
        assert!(store.compare_and_set("r", column("c", "v1", 1), None, None).await.unwrap());
        assert!(!store.compare_and_set("r", column("c", "v2", 2), None, None).await.unwrap());

        let v1 = Bytes::from_static(b"v1");
        assert!(store.compare_and_set("r", column("c", "v2", 0), Some(&v1), None).await.unwrap());
        let read = store.get_column("r", "c").await.unwrap().unwrap();
        assert_eq!(read.value, Bytes::from_static(b"v2"));
        assert!(read.timestamp > 1);

        assert!(!store.compare_and_set("r", column("c", "v3", 5), Some(&v1), None).await.unwrap());
    }
}
