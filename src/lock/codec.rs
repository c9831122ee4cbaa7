//! Row and column formats of the lock column family.
//!
//! ```text
//! meta:{lockId}      lock_metadata                  -> {"lock_row_id", "lock_count", ...}
//! main:{lockRowId}   {threshold:020}:{ownerId}      -> {"renewals"}
//! shade:{lockRowId}  {threshold:020}:{ownerId}      -> {"renewals"}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::metadata::LockMetadata;
use crate::storage::Column;
use crate::util::exception::{Exception, LockResult};

pub(crate) const METADATA_COLUMN: &str = "lock_metadata";

pub(crate) fn metadata_row_key(lock_id: &str) -> String {
    format!("meta:{}", lock_id)
}

pub(crate) fn main_row_key(lock_row_id: &str) -> String {
    format!("main:{}", lock_row_id)
}

pub(crate) fn shade_row_key(lock_row_id: &str) -> String {
    format!("shade:{}", lock_row_id)
}

/// Physical row serving the `acquisition`-th acquisition of `lock_id`.
pub(crate) fn lock_row_id_for(lock_id: &str, acquisition: u64, change_lock_row_threshold: u32) -> String {
    let generation = acquisition / u64::from(change_lock_row_threshold.max(1));
    if generation == 0 {
        lock_id.to_string()
    } else {
        format!("{}@{}", lock_id, generation)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredLockMetadata {
    lock_row_id: String,
    lock_count: u64,
    previous_threshold: Option<i64>,
    probable_owner_thread_id: Option<String>,
}

pub(crate) fn encode_metadata(metadata: &LockMetadata) -> LockResult<Bytes> {
    let stored = StoredLockMetadata {
        lock_row_id: metadata.lock_row_id.clone(),
        lock_count: metadata.lock_count,
        previous_threshold: metadata.previous_threshold,
        probable_owner_thread_id: metadata.probable_owner_thread_id.clone(),
    };
    Ok(Bytes::from(serde_json::to_vec(&stored)?))
}

pub(crate) fn decode_metadata(lock_id: &str, column: &Column) -> LockResult<LockMetadata> {
    let stored: StoredLockMetadata = serde_json::from_slice(&column.value)?;
    Ok(LockMetadata {
        lock_id: lock_id.to_string(),
        lock_row_id: stored.lock_row_id,
        lock_count: stored.lock_count,
        previous_threshold: stored.previous_threshold,
        probable_owner_thread_id: stored.probable_owner_thread_id,
        timestamp: column.timestamp,
    })
}

/// A claim of ownership stored in a main or shade row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClaimColumn {
    pub(crate) threshold: i64,
    pub(crate) owner_id: String,
}

impl ClaimColumn {
    pub(crate) fn new(threshold: i64, owner_id: &str) -> Self {
        Self {
            threshold,
            owner_id: owner_id.to_string(),
        }
    }

    pub(crate) fn column_name(&self) -> String {
        format!("{}:{}", threshold_cursor(self.threshold), self.owner_id)
    }

    pub(crate) fn parse(column_name: &str) -> LockResult<Self> {
        let (threshold, owner_id) = column_name
            .split_once(':')
            .ok_or_else(|| Exception::Codec(format!("Malformed claim column name: {}", column_name)))?;
        let threshold = threshold
            .parse::<i64>()
            .map_err(|e| Exception::Codec(format!("Malformed claim threshold in {}: {}", column_name, e)))?;
        if owner_id.is_empty() {
            return Err(Exception::Codec(format!("Claim column without owner: {}", column_name)));
        }
        Ok(Self::new(threshold, owner_id))
    }
}

/// Exclusive range cursor that selects every claim with a threshold at or
/// above `threshold`: `"{t:020}"` sorts before `"{t:020}:{owner}"`.
pub(crate) fn threshold_cursor(threshold: i64) -> String {
    format!("{:020}", threshold.max(0))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ClaimRecord {
    pub(crate) renewals: u32,
}

impl ClaimRecord {
    pub(crate) fn encode(&self) -> LockResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub(crate) fn decode(value: &[u8]) -> LockResult<Self> {
        Ok(serde_json::from_slice(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::metadata::NewLockMetadata;

    #[test]
    fn written_metadata_reads_back() {
        let intent = NewLockMetadata {
            lock_id: "orders".to_string(),
            lock_row_id: "orders@3".to_string(),
            lock_count: 31,
            threshold: 1_600_000_000_000_000,
            owner_thread_id: "9b3c".to_string(),
        };
        let written = intent.clone().into_metadata(1_600_000_000_000_123);
        let column = Column {
            name: METADATA_COLUMN.to_string(),
            value: encode_metadata(&written).unwrap(),
            timestamp: written.timestamp,
        };

        let read = decode_metadata("orders", &column).unwrap();
        assert_eq!(read, written);
        assert_eq!(read.lock_id, intent.lock_id);
        assert_eq!(read.lock_row_id, intent.lock_row_id);
        assert_eq!(read.lock_count, intent.lock_count);
        assert_eq!(read.previous_threshold, Some(intent.threshold));
        assert_eq!(read.probable_owner_thread_id.as_deref(), Some("9b3c"));
    }

    #[test]
    fn garbage_metadata_is_a_codec_error() {
        let column = Column {
            name: METADATA_COLUMN.to_string(),
            value: Bytes::from_static(b"not json"),
            timestamp: 1,
        };
        assert!(matches!(decode_metadata("x", &column), Err(Exception::Codec(_))));
    }

    #[test]
    fn claim_column_names_round_trip() {
        let claim = ClaimColumn::new(42, "owner-a");
        assert_eq!(claim.column_name(), "00000000000000000042:owner-a");
        assert_eq!(ClaimColumn::parse(&claim.column_name()).unwrap(), claim);
        assert!(ClaimColumn::parse("no-separator").is_err());
        assert!(ClaimColumn::parse("abc:owner").is_err());
        assert!(ClaimColumn::parse("00000000000000000042:").is_err());
    }

    #[test]
    fn cursor_selects_claims_at_or_above_threshold() {
        let cursor = threshold_cursor(100);
        let older = ClaimColumn::new(99, "z").column_name();
        let same = ClaimColumn::new(100, "a").column_name();
        let newer = ClaimColumn::new(1_000, "a").column_name();
        assert!(older < cursor);
        assert!(same > cursor);
        assert!(newer > cursor);
    }

    #[test]
    fn rows_rotate_every_threshold_acquisitions() {
        assert_eq!(lock_row_id_for("l", 0, 10), "l");
        assert_eq!(lock_row_id_for("l", 9, 10), "l");
        assert_eq!(lock_row_id_for("l", 10, 10), "l@1");
        assert_eq!(lock_row_id_for("l", 25, 10), "l@2");
        assert_eq!(lock_row_id_for("l", 3, 1), "l@3");
    }

    #[test]
    fn claim_records_round_trip() {
        let record = ClaimRecord { renewals: 7 };
        assert_eq!(ClaimRecord::decode(&record.encode().unwrap()).unwrap(), record);
    }
}
