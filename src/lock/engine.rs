//! Lock algorithm over a [`ColumnStore`].
//!
//! Ownership is a claim column in the main row of the lock, written with a
//! TTL of `lock_ttl` and refreshed by every relock. Acquirers first announce
//! themselves in the shade row so that racing candidates see each other before
//! anybody touches the main row, and the winner is settled by a
//! compare-and-set of the metadata record read at the start of the attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::codec::{
    decode_metadata, encode_metadata, lock_row_id_for, main_row_key, metadata_row_key, shade_row_key,
    threshold_cursor, ClaimColumn, ClaimRecord, METADATA_COLUMN,
};
use super::metadata::{LockMetadata, NewLockMetadata};
use super::settings::LockSettings;
use super::{LockAttemptResult, RemoteLockImplementation};
use crate::storage::{Column, ColumnStore};
use crate::util::exception::{Exception, LockResult};

const PAGE_SIZE: usize = 1000;

/// Metadata as read, together with the raw bytes the next write is
/// conditioned on.
struct MetadataSnapshot {
    metadata: LockMetadata,
    raw: Option<Bytes>,
}

pub struct LockEngine {
    store: Arc<dyn ColumnStore>,
    settings: LockSettings,
}

impl LockEngine {
    pub fn new(store: Arc<dyn ColumnStore>, settings: LockSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Owners holding a live claim in the main row of the lock.
    pub async fn main_row_owners(&self, lock_id: &str) -> LockResult<Vec<String>> {
        let snapshot = self.read_metadata(lock_id).await?;
        let claims = self
            .read_claims(&main_row_key(&snapshot.metadata.lock_row_id), snapshot.metadata.previous_threshold)
            .await?;
        Ok(distinct_owners(&claims))
    }

    /// Owners announced in the shade row, i.e. candidates in the middle of an
    /// acquisition.
    pub async fn shade_row_owners(&self, lock_id: &str) -> LockResult<Vec<String>> {
        let snapshot = self.read_metadata(lock_id).await?;
        let claims = self
            .read_claims(&shade_row_key(&snapshot.metadata.lock_row_id), snapshot.metadata.previous_threshold)
            .await?;
        Ok(distinct_owners(&claims))
    }

    pub async fn lock_metadata(&self, lock_id: &str) -> LockResult<LockMetadata> {
        validate_lock_id(lock_id)?;
        Ok(self.read_metadata(lock_id).await?.metadata)
    }

    fn now(&self) -> i64 {
        self.settings.timestamp_provider.now_ticks()
    }

    /// Timestamp for a write that has to supersede a cell stamped `previous`,
    /// whatever the local clock says.
    fn timestamp_after(&self, previous: i64) -> i64 {
        self.now().max(previous.saturating_add(1))
    }

    async fn read_metadata(&self, lock_id: &str) -> LockResult<MetadataSnapshot> {
        match self.store.get_column(&metadata_row_key(lock_id), METADATA_COLUMN).await? {
            Some(column) => Ok(MetadataSnapshot {
                metadata: decode_metadata(lock_id, &column)?,
                raw: Some(column.value),
            }),
            None => Ok(MetadataSnapshot {
                metadata: LockMetadata::empty(lock_id),
                raw: None,
            }),
        }
    }

    /// Conditionally replaces the metadata read in `snapshot` with `metadata`.
    async fn swap_metadata(&self, snapshot: &MetadataSnapshot, metadata: &LockMetadata) -> LockResult<bool> {
        let column = Column::new(METADATA_COLUMN, encode_metadata(metadata)?, self.now());
        self.store
            .compare_and_set(
                &metadata_row_key(&metadata.lock_id),
                column,
                snapshot.raw.as_ref(),
                Some(self.settings.lock_metadata_ttl),
            )
            .await
    }

    /// Live claims of a row with a threshold at or above `from`.
    async fn read_claims(&self, row_key: &str, from: Option<i64>) -> LockResult<Vec<(ClaimColumn, Column)>> {
        let mut cursor = from.map(threshold_cursor);
        let mut claims = Vec::new();
        loop {
            let page = self.store.get_columns(row_key, cursor.as_deref(), PAGE_SIZE).await?;
            let exhausted = page.len() < PAGE_SIZE;
            cursor = page.last().map(|column| column.name.clone());
            for column in page {
                claims.push((ClaimColumn::parse(&column.name)?, column));
            }
            if exhausted {
                return Ok(claims);
            }
        }
    }

    async fn write_claim(&self, row_key: &str, claim: &ClaimColumn, record: ClaimRecord, timestamp: i64) -> LockResult<()> {
        let column = Column::new(claim.column_name(), record.encode()?, timestamp);
        self.store.add_column(row_key, column, Some(self.settings.lock_ttl)).await
    }

    async fn delete_claim(&self, row_key: &str, claim: &ClaimColumn, written_at: i64) -> LockResult<()> {
        self.store
            .delete_column(row_key, &claim.column_name(), self.timestamp_after(written_at))
            .await
    }

    /// Cleanup after the outcome of an attempt is already decided. A failure
    /// only leaves a claim behind until its TTL runs out.
    async fn discard_claim(&self, row_key: &str, claim: &ClaimColumn, written_at: i64) {
        if let Err(e) = self.delete_claim(row_key, claim, written_at).await {
            warn!(
                row_key,
                owner_id = %claim.owner_id,
                error = %e,
                "Failed to delete claim, it will expire by TTL"
            );
        }
    }

    async fn battle(&self, snapshot: &MetadataSnapshot, owner_id: &str) -> LockResult<LockAttemptResult> {
        let current = &snapshot.metadata;
        let threshold = match current.previous_threshold {
            Some(previous) => self.now().max(previous.saturating_add(1)),
            None => self.now(),
        };
        let intent = NewLockMetadata {
            lock_id: current.lock_id.clone(),
            lock_row_id: lock_row_id_for(&current.lock_id, current.lock_count, self.settings.change_lock_row_threshold),
            lock_count: current.lock_count + 1,
            threshold,
            owner_thread_id: owner_id.to_string(),
        };
        debug!(lock_id = %current.lock_id, owner_id, intent = %intent, "Trying to claim lock");

        let claim = ClaimColumn::new(threshold, owner_id);
        let shade_row = shade_row_key(&intent.lock_row_id);
        let main_row = main_row_key(&intent.lock_row_id);

        let shade_written_at = self.now();
        self.write_claim(&shade_row, &claim, ClaimRecord::default(), shade_written_at)
            .await?;
        let outcome = self.contest(snapshot, intent, &claim, &shade_row, &main_row).await;
        self.discard_claim(&shade_row, &claim, shade_written_at).await;
        outcome
    }

    /// Settles a battle once the shade claim of `claim` is in place.
    async fn contest(
        &self,
        snapshot: &MetadataSnapshot,
        intent: NewLockMetadata,
        claim: &ClaimColumn,
        shade_row: &str,
        main_row: &str,
    ) -> LockResult<LockAttemptResult> {
        let from = snapshot.metadata.previous_threshold;
        let shade = self.read_claims(shade_row, from).await?;
        if shade.iter().any(|(rival, _)| rival.owner_id != claim.owner_id) {
            return Ok(LockAttemptResult::ConcurrentAttempt);
        }

        let main = self.read_claims(main_row, from).await?;
        if let Some((rival, _)) = main.iter().find(|(rival, _)| rival.owner_id != claim.owner_id) {
            return Ok(LockAttemptResult::AnotherOwner(rival.owner_id.clone()));
        }

        let main_written_at = self.now();
        let committed = intent.into_metadata(main_written_at);
        let swapped = match self
            .write_claim(main_row, claim, ClaimRecord::default(), main_written_at)
            .await
        {
            Ok(()) => self.swap_metadata(snapshot, &committed).await,
            Err(e) => Err(e),
        };
        match swapped {
            Ok(true) => {
                debug!(lock_id = %committed.lock_id, owner_id = %claim.owner_id, metadata = %committed, "Lock claimed");
                Ok(LockAttemptResult::Success)
            }
            Ok(false) => {
                debug!(
                    lock_id = %committed.lock_id,
                    owner_id = %claim.owner_id,
                    "Lock metadata changed under the attempt"
                );
                self.discard_claim(main_row, claim, main_written_at).await;
                Ok(LockAttemptResult::ConcurrentAttempt)
            }
            Err(e) => {
                // The outcome is unknown, so the main claim must not outlive the attempt.
                self.discard_claim(main_row, claim, main_written_at).await;
                Err(e)
            }
        }
    }

    /// Moves a long-held claim to a fresh threshold so readers can skip the
    /// tombstones its renewals leave behind.
    async fn rotate_threshold(
        &self,
        snapshot: &MetadataSnapshot,
        main_row: &str,
        claim: &ClaimColumn,
        column: &Column,
    ) -> LockResult<bool> {
        let metadata = &snapshot.metadata;
        let threshold = self.now().max(claim.threshold.saturating_add(1));
        let rotated = ClaimColumn::new(threshold, &claim.owner_id);
        let written_at = self.now();
        self.write_claim(main_row, &rotated, ClaimRecord::default(), written_at)
            .await?;

        let advanced = LockMetadata {
            previous_threshold: Some(threshold),
            ..metadata.clone()
        };
        if !self.swap_metadata(snapshot, &advanced).await? {
            warn!(
                lock_id = %metadata.lock_id,
                owner_id = %claim.owner_id,
                "Lock metadata changed while rotating the claim threshold"
            );
            self.discard_claim(main_row, &rotated, written_at).await;
            return Ok(false);
        }

        self.discard_claim(main_row, claim, column.timestamp).await;
        debug!(
            lock_id = %metadata.lock_id,
            owner_id = %claim.owner_id,
            from = claim.threshold,
            to = threshold,
            "Claim threshold rotated"
        );
        Ok(true)
    }
}

#[async_trait]
impl RemoteLockImplementation for LockEngine {
    fn lock_ttl(&self) -> Duration {
        self.settings.lock_ttl
    }

    fn keep_lock_alive_interval(&self) -> Duration {
        self.settings.keep_lock_alive_interval
    }

    async fn try_lock(&self, lock_id: &str, owner_id: &str) -> LockResult<LockAttemptResult> {
        validate_lock_id(lock_id)?;
        validate_owner_id(owner_id)?;

        let snapshot = self.read_metadata(lock_id).await?;
        let metadata = &snapshot.metadata;
        let main_row = main_row_key(&metadata.lock_row_id);

        if let (Some(probable_owner), Some(threshold)) =
            (&metadata.probable_owner_thread_id, metadata.previous_threshold)
        {
            let claim = ClaimColumn::new(threshold, probable_owner);
            if self.store.get_column(&main_row, &claim.column_name()).await?.is_some() {
                return Ok(if probable_owner == owner_id {
                    LockAttemptResult::Success
                } else {
                    LockAttemptResult::AnotherOwner(probable_owner.clone())
                });
            }
        }

        let claims = self.read_claims(&main_row, metadata.previous_threshold).await?;
        if let Some((rival, _)) = claims.iter().find(|(claim, _)| claim.owner_id != owner_id) {
            return Ok(LockAttemptResult::AnotherOwner(rival.owner_id.clone()));
        }
        // Own claims the metadata does not point at are leftovers of a lost
        // race, so the lock still has to be won.

        self.battle(&snapshot, owner_id).await
    }

    async fn try_relock(&self, lock_id: &str, owner_id: &str) -> LockResult<bool> {
        validate_lock_id(lock_id)?;
        validate_owner_id(owner_id)?;

        let snapshot = self.read_metadata(lock_id).await?;
        let metadata = &snapshot.metadata;
        let threshold = match (&metadata.probable_owner_thread_id, metadata.previous_threshold) {
            (Some(probable_owner), Some(threshold)) if probable_owner == owner_id => threshold,
            _ => {
                debug!(lock_id, owner_id, metadata = %metadata, "Lock is no longer owned");
                return Ok(false);
            }
        };

        let main_row = main_row_key(&metadata.lock_row_id);
        let claim = ClaimColumn::new(threshold, owner_id);
        let column = match self.store.get_column(&main_row, &claim.column_name()).await? {
            Some(column) => column,
            None => {
                debug!(lock_id, owner_id, "Claim has expired");
                return Ok(false);
            }
        };

        let record = ClaimRecord::decode(&column.value)?;
        let renewals = record.renewals.saturating_add(1);
        if renewals >= self.settings.change_lock_row_threshold {
            return self.rotate_threshold(&snapshot, &main_row, &claim, &column).await;
        }

        // The metadata row has its own TTL and must outlive every claim it points at.
        if !self.swap_metadata(&snapshot, metadata).await? {
            debug!(lock_id, owner_id, "Lock metadata changed during renewal");
            return Ok(false);
        }
        self.write_claim(&main_row, &claim, ClaimRecord { renewals }, self.timestamp_after(column.timestamp))
            .await?;
        Ok(true)
    }

    async fn try_unlock(&self, lock_id: &str, owner_id: &str) -> LockResult<bool> {
        validate_lock_id(lock_id)?;
        validate_owner_id(owner_id)?;

        let snapshot = self.read_metadata(lock_id).await?;
        let metadata = &snapshot.metadata;
        let main_row = main_row_key(&metadata.lock_row_id);

        let mut found = false;
        for (claim, column) in self.read_claims(&main_row, metadata.previous_threshold).await? {
            if claim.owner_id == owner_id {
                self.delete_claim(&main_row, &claim, column.timestamp).await?;
                found = true;
            }
        }

        if metadata.probable_owner_thread_id.as_deref() == Some(owner_id) {
            let cleared = LockMetadata {
                probable_owner_thread_id: None,
                ..metadata.clone()
            };
            if !self.swap_metadata(&snapshot, &cleared).await? {
                debug!(lock_id, owner_id, "Lock metadata changed before the owner could be cleared");
            }
        }

        if !found {
            debug!(lock_id, owner_id, "No claim left to unlock");
        }
        Ok(found)
    }
}

fn distinct_owners(claims: &[(ClaimColumn, Column)]) -> Vec<String> {
    let mut owners: Vec<String> = Vec::with_capacity(claims.len());
    for (claim, _) in claims {
        if !owners.contains(&claim.owner_id) {
            owners.push(claim.owner_id.clone());
        }
    }
    owners
}

pub(crate) fn validate_lock_id(lock_id: &str) -> LockResult<()> {
    if lock_id.is_empty() {
        return Err(Exception::InvalidArgument("lockId is empty".to_string()));
    }
    Ok(())
}

pub(crate) fn validate_owner_id(owner_id: &str) -> LockResult<()> {
    if owner_id.is_empty() {
        return Err(Exception::InvalidArgument("ownerId is empty".to_string()));
    }
    Ok(())
}
