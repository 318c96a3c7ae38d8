//! Durable sync state: committed records and per-account cursors.
//!
//! `SyncStateStore` is the single writer of both state files. Every mutation is persisted before
//! it returns, so a record reported as committed survives a crash. Record changes are appended
//! to the record log rather than rewriting it, so a commit costs one line. Records are unique per
//! `(source_transaction_id, destination_system)`; the store enforces this with an index and
//! [`SyncStateStore::insert_if_absent`].

use crate::budget::sync::repositories::{
    CursorRepository, FileCursorRepository, FileSyncRecordRepository, SyncRecordRepository,
};
use crate::budget::types::{
    CanonicalTransaction, DestinationSystem, RecordKey, StoreError, SyncCursor, SyncRecord,
};
use crate::destination::idempotency_key;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Default)]
struct StoreState {
    records: Vec<SyncRecord>,
    index: HashMap<RecordKey, usize>,
    cursors: HashMap<String, SyncCursor>,
}

impl StoreState {
    fn rebuild_index(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(position, record)| (record.key(), position))
            .collect();
    }

    fn get(&self, source_transaction_id: &str, system: DestinationSystem) -> Option<&SyncRecord> {
        self.index
            .get(&(source_transaction_id.to_string(), system))
            .map(|&position| &self.records[position])
    }
}

/// Store for sync records and cursors.
pub struct SyncStateStore {
    record_repo: Box<dyn SyncRecordRepository>,
    cursor_repo: Box<dyn CursorRepository>,
    state: Mutex<StoreState>,
}

impl SyncStateStore {
    /// Open the file-backed store in `data_dir`, loading any existing state.
    pub async fn open(data_dir: PathBuf) -> Result<Self, StoreError> {
        Self::with_repositories(
            Box::new(FileSyncRecordRepository::new(data_dir.clone())),
            Box::new(FileCursorRepository::new(data_dir)),
        )
        .await
    }

    pub async fn with_repositories(
        record_repo: Box<dyn SyncRecordRepository>,
        cursor_repo: Box<dyn CursorRepository>,
    ) -> Result<Self, StoreError> {
        // The record log yields one record per key, latest version wins.
        let mut state = StoreState {
            records: record_repo.load().await?,
            cursors: cursor_repo.load().await?,
            ..StoreState::default()
        };
        state.rebuild_index();

        info!(
            "Sync state ready: {} records, {} cursors",
            state.records.len(),
            state.cursors.len()
        );
        Ok(Self {
            record_repo,
            cursor_repo,
            state: Mutex::new(state),
        })
    }

    /// Record committed for `source_transaction_id` in `system`, if any.
    pub async fn find(
        &self,
        source_transaction_id: &str,
        system: DestinationSystem,
    ) -> Option<SyncRecord> {
        let state = self.state.lock().await;
        state.get(source_transaction_id, system).cloned()
    }

    /// Persist `record` unless its key is already present.
    ///
    /// Returns `false` when a record with the same key exists. On a persistence failure the
    /// in-memory state is left untouched and the error returned.
    pub async fn insert_if_absent(&self, record: SyncRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = record.key();
        if state.index.contains_key(&key) {
            return Ok(false);
        }

        self.record_repo.append(std::slice::from_ref(&record)).await?;

        let position = state.records.len();
        state.records.push(record);
        state.index.insert(key, position);
        Ok(true)
    }

    /// Link a pending record to the settled transaction that replaced it.
    ///
    /// Marks the pending record as settled (optionally pointing it at a new destination row)
    /// and records the settled transaction against the same destination row, so later runs
    /// treat the settled transaction as already synced.
    pub async fn link_settlement(
        &self,
        pending_id: &str,
        system: DestinationSystem,
        settled: &CanonicalTransaction,
        destination_transaction_id: Option<String>,
    ) -> Result<SyncRecord, StoreError> {
        let mut state = self.state.lock().await;
        let pending_position = *state
            .index
            .get(&(pending_id.to_string(), system))
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", pending_id, system)))?;

        let previous = &state.records[pending_position];
        let destination_transaction_id =
            destination_transaction_id.unwrap_or_else(|| previous.destination_transaction_id.clone());
        let pending = SyncRecord {
            settled_by: Some(settled.source_transaction_id.clone()),
            destination_transaction_id: destination_transaction_id.clone(),
            ..previous.clone()
        };

        let settled_key = (settled.source_transaction_id.clone(), system);
        let existing = state.index.get(&settled_key).copied();
        let linked = match existing {
            Some(position) => state.records[position].clone(),
            None => SyncRecord {
                source_transaction_id: settled.source_transaction_id.clone(),
                destination_transaction_id,
                committed_at: Utc::now(),
                amount: settled.amount,
                posted_at: settled.posted_at,
                description: settled.description.clone(),
                is_pending: false,
                settled_by: None,
                settles: Some(pending_id.to_string()),
                ..pending.clone()
            },
        };

        // Both versions go out in one append; memory only changes once it is durable.
        let mut changed = vec![pending.clone()];
        if existing.is_none() {
            changed.push(linked.clone());
        }
        self.record_repo.append(&changed).await?;

        state.records[pending_position] = pending;
        if existing.is_none() {
            let position = state.records.len();
            state.records.push(linked.clone());
            state.index.insert(settled_key, position);
        }
        Ok(linked)
    }

    /// Pending records for a source account that have not been settled yet.
    pub async fn unsettled_pending(
        &self,
        system: DestinationSystem,
        source_account_id: &str,
    ) -> Vec<SyncRecord> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|record| {
                record.destination_system == system
                    && record.source_account_id == source_account_id
                    && record.is_pending
                    && record.settled_by.is_none()
            })
            .cloned()
            .collect()
    }

    /// Destination ids already claimed by a record in `system`.
    pub async fn claimed_destination_ids(&self, system: DestinationSystem) -> HashSet<String> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|record| record.destination_system == system)
            .map(|record| record.destination_transaction_id.clone())
            .collect()
    }

    /// Idempotency keys of every record in `system`.
    ///
    /// A destination row imported under one of these keys belongs to a synced transaction, even
    /// when the record only holds a placeholder id for it.
    pub async fn claimed_import_keys(&self, system: DestinationSystem) -> HashSet<String> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|record| record.destination_system == system)
            .map(|record| idempotency_key(&record.source_transaction_id))
            .collect()
    }

    /// All records committed from one source account to one destination.
    pub async fn records_for_source_account(
        &self,
        system: DestinationSystem,
        source_account_id: &str,
    ) -> Vec<SyncRecord> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .filter(|record| {
                record.destination_system == system && record.source_account_id == source_account_id
            })
            .cloned()
            .collect()
    }

    pub async fn cursor(&self, source_account_id: &str) -> Option<SyncCursor> {
        let state = self.state.lock().await;
        state.cursors.get(source_account_id).cloned()
    }

    /// Persist the cursor for a source account.
    pub async fn save_cursor(
        &self,
        source_account_id: &str,
        cursor: SyncCursor,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let previous = state.cursors.insert(source_account_id.to_string(), cursor);
        if let Err(e) = self.cursor_repo.save(&state.cursors).await {
            match previous {
                Some(previous) => state.cursors.insert(source_account_id.to_string(), previous),
                None => state.cursors.remove(source_account_id),
            };
            return Err(e);
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::sync::repositories::memory::{
        MemoryCursorRepository, MemorySyncRecordRepository,
    };
    use crate::budget::types::AccountMapping;
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    fn mapping() -> AccountMapping {
        AccountMapping {
            source_account_id: "acc_123".to_string(),
            source_account_name: None,
            destination_system: DestinationSystem::Ynab,
            destination_account_id: "ynab-acc".to_string(),
            destination_budget_id: Some("budget_9".to_string()),
            tracking: false,
        }
    }

    fn transaction(id: &str, pending: bool) -> CanonicalTransaction {
        CanonicalTransaction {
            source_transaction_id: id.to_string(),
            source_account_id: "acc_123".to_string(),
            posted_at: Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap(),
            amount: -2000,
            currency: "NZD".to_string(),
            description: "CAFE".to_string(),
            payee: None,
            is_pending: pending,
        }
    }

    fn record(id: &str, pending: bool) -> SyncRecord {
        SyncRecord::committed(
            &transaction(id, pending),
            &mapping(),
            format!("dest-{}", id),
            Utc::now(),
        )
    }

    async fn memory_store() -> (SyncStateStore, MemorySyncRecordRepository) {
        let records = MemorySyncRecordRepository::default();
        let store = SyncStateStore::with_repositories(
            Box::new(records.clone()),
            Box::new(MemoryCursorRepository::default()),
        )
        .await
        .unwrap();
        (store, records)
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_first_record() {
        let (store, _) = memory_store().await;
        assert!(store.insert_if_absent(record("t1", false)).await.unwrap());

        let mut duplicate = record("t1", false);
        duplicate.destination_transaction_id = "other".to_string();
        assert!(!store.insert_if_absent(duplicate).await.unwrap());

        let found = store.find("t1", DestinationSystem::Ynab).await.unwrap();
        assert_eq!(found.destination_transaction_id, "dest-t1");
        assert!(store.find("t1", DestinationSystem::ActualBudget).await.is_none());
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn failed_save_rolls_back_insert() {
        let (store, records) = memory_store().await;
        records.fail_appends.store(true, Ordering::SeqCst);
        assert!(store.insert_if_absent(record("t1", false)).await.is_err());
        assert!(store.find("t1", DestinationSystem::Ynab).await.is_none());

        records.fail_appends.store(false, Ordering::SeqCst);
        assert!(store.insert_if_absent(record("t1", false)).await.unwrap());
    }

    #[tokio::test]
    async fn each_commit_appends_one_record() {
        let (store, records) = memory_store().await;
        store.insert_if_absent(record("t1", false)).await.unwrap();
        store.insert_if_absent(record("t2", false)).await.unwrap();
        store.insert_if_absent(record("t1", false)).await.unwrap();
        assert_eq!(records.log.read().await.len(), 2);

        store.insert_if_absent(record("p1", true)).await.unwrap();
        store
            .link_settlement("p1", DestinationSystem::Ynab, &transaction("s1", false), None)
            .await
            .unwrap();
        // The settled version of p1 and the new s1 record
        assert_eq!(records.log.read().await.len(), 5);
    }

    #[tokio::test]
    async fn failed_settlement_leaves_pending_unsettled() {
        let (store, records) = memory_store().await;
        store.insert_if_absent(record("p1", true)).await.unwrap();

        records.fail_appends.store(true, Ordering::SeqCst);
        assert!(
            store
                .link_settlement("p1", DestinationSystem::Ynab, &transaction("s1", false), None)
                .await
                .is_err()
        );
        assert!(store.find("s1", DestinationSystem::Ynab).await.is_none());
        assert_eq!(
            store
                .unsettled_pending(DestinationSystem::Ynab, "acc_123")
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn settlement_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SyncStateStore::open(dir.path().to_path_buf()).await.unwrap();
            store.insert_if_absent(record("p1", true)).await.unwrap();
            store
                .link_settlement(
                    "p1",
                    DestinationSystem::Ynab,
                    &transaction("s1", false),
                    Some("dest-s1".to_string()),
                )
                .await
                .unwrap();
        }

        let reopened = SyncStateStore::open(dir.path().to_path_buf()).await.unwrap();
        let pending = reopened.find("p1", DestinationSystem::Ynab).await.unwrap();
        assert_eq!(pending.settled_by.as_deref(), Some("s1"));
        assert_eq!(pending.destination_transaction_id, "dest-s1");
        assert_eq!(
            reopened.find("s1", DestinationSystem::Ynab).await.unwrap().settles.as_deref(),
            Some("p1")
        );
        assert_eq!(reopened.record_count().await, 2);
    }

    #[tokio::test]
    async fn settlement_links_both_records() {
        let (store, _) = memory_store().await;
        store.insert_if_absent(record("p1", true)).await.unwrap();
        assert_eq!(
            store
                .unsettled_pending(DestinationSystem::Ynab, "acc_123")
                .await
                .len(),
            1
        );

        let linked = store
            .link_settlement("p1", DestinationSystem::Ynab, &transaction("s1", false), None)
            .await
            .unwrap();
        assert_eq!(linked.destination_transaction_id, "dest-p1");
        assert_eq!(linked.settles.as_deref(), Some("p1"));

        let pending = store.find("p1", DestinationSystem::Ynab).await.unwrap();
        assert_eq!(pending.settled_by.as_deref(), Some("s1"));
        assert!(
            store
                .unsettled_pending(DestinationSystem::Ynab, "acc_123")
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SyncStateStore::open(dir.path().to_path_buf()).await.unwrap();
            store.insert_if_absent(record("t1", false)).await.unwrap();
            store
                .save_cursor(
                    "acc_123",
                    SyncCursor::at(Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap()),
                )
                .await
                .unwrap();
        }

        let reopened = SyncStateStore::open(dir.path().to_path_buf()).await.unwrap();
        assert!(reopened.find("t1", DestinationSystem::Ynab).await.is_some());
        assert_eq!(
            reopened.cursor("acc_123").await.unwrap().last_posted_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap()
        );
        assert!(
            reopened
                .claimed_destination_ids(DestinationSystem::Ynab)
                .await
                .contains("dest-t1")
        );
    }
}
