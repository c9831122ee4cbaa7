use std::fmt;

/// Per-lock bookkeeping record as last read from the metadata row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMetadata {
    pub lock_id: String,

    /// Physical row holding the claims. Starts as the lock id and moves to a
    /// fresh row every `change_lock_row_threshold` acquisitions.
    pub lock_row_id: String,

    /// Number of successful acquisitions of this lock id.
    pub lock_count: u64,

    /// Threshold of the latest claim. Claims are written under column names
    /// prefixed with their threshold, so reads can start here and skip the
    /// tombstones of older claims instead of scanning the whole row.
    pub previous_threshold: Option<i64>,

    /// Last known owner. Lets a rival check a single column instead of
    /// scanning the row while a long lock is being held.
    pub probable_owner_thread_id: Option<String>,

    /// Store-side write timestamp of the record, 0 when it was never written.
    pub timestamp: i64,
}

impl LockMetadata {
    /// Record for a lock id that has never been acquired (or whose metadata
    /// has expired).
    pub fn empty(lock_id: &str) -> Self {
        Self {
            lock_id: lock_id.to_string(),
            lock_row_id: lock_id.to_string(),
            lock_count: 0,
            previous_threshold: None,
            probable_owner_thread_id: None,
            timestamp: 0,
        }
    }
}

impl fmt::Display for LockMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LockId: {}, LockRowId: {}, LockCount: {}, PreviousThreshold: {:?}, ProbableOwnerThreadId: {:?}, Timestamp: {}",
            self.lock_id,
            self.lock_row_id,
            self.lock_count,
            self.previous_threshold,
            self.probable_owner_thread_id,
            self.timestamp
        )
    }
}

/// Write intent produced by the engine before it claims a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLockMetadata {
    pub lock_id: String,
    pub lock_row_id: String,
    pub lock_count: u64,
    pub threshold: i64,
    pub owner_thread_id: String,
}

impl NewLockMetadata {
    /// The record a successful write of this intent leaves behind.
    pub fn into_metadata(self, timestamp: i64) -> LockMetadata {
        LockMetadata {
            lock_id: self.lock_id,
            lock_row_id: self.lock_row_id,
            lock_count: self.lock_count,
            previous_threshold: Some(self.threshold),
            probable_owner_thread_id: Some(self.owner_thread_id),
            timestamp,
        }
    }
}

impl fmt::Display for NewLockMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LockId: {}, LockRowId: {}, LockCount: {}, Threshold: {}, OwnerThreadId: {}",
            self.lock_id, self.lock_row_id, self.lock_count, self.threshold, self.owner_thread_id
        )
    }
}
