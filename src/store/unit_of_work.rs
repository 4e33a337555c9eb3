//! Unit of work over one store transaction
//!
//! Tracks every record modified during a cascade along with its delete flag
//! as it was first loaded, stamps modification times on save, and runs the
//! registered [`SaveInterceptor`]s around save, commit, and rollback.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Store, StoreTransaction, Visibility};
use crate::entity::{Record, Transition};
use crate::types::{CascadeError, Result};

/// Commit attempts when the server cannot confirm the outcome
const COMMIT_ATTEMPTS: u32 = 3;

/// A pending change as seen by the interceptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedChange {
    pub entity_type: String,
    pub id: Uuid,
    /// Delete flag when the record was first loaded in this unit of work
    pub was_deleted: bool,
    pub is_deleted: bool,
}

impl TrackedChange {
    /// The delete-flag transition this change represents, if any
    pub fn transition(&self) -> Option<Transition> {
        match (self.was_deleted, self.is_deleted) {
            (false, true) => Some(Transition::SoftDelete),
            (true, false) => Some(Transition::Restore),
            _ => None,
        }
    }
}

/// Hooks around unit-of-work persistence
#[async_trait]
pub trait SaveInterceptor: Send + Sync {
    /// Before pending changes are written; an error aborts the save
    async fn saving_changes(&self, _unit_id: Uuid, _changes: &[TrackedChange]) -> Result<()> {
        Ok(())
    }

    /// After the transaction committed; `persisted` counts rows across all saves
    async fn saved_changes(&self, _unit_id: Uuid, _persisted: u64) -> Result<()> {
        Ok(())
    }

    /// The unit of work ended without committing
    fn rolled_back(&self, _unit_id: Uuid) {}
}

struct Tracked {
    original_deleted: bool,
    record: Record,
}

pub struct UnitOfWork {
    id: Uuid,
    tx: Option<Box<dyn StoreTransaction>>,
    tracked: Vec<Tracked>,
    index: HashMap<Uuid, usize>,
    interceptors: Vec<Arc<dyn SaveInterceptor>>,
    persisted: u64,
}

impl UnitOfWork {
    pub async fn begin(
        store: &dyn Store,
        interceptors: Vec<Arc<dyn SaveInterceptor>>,
    ) -> Result<Self> {
        let tx = store.begin().await?;
        let id = Uuid::new_v4();
        debug!(unit_id = %id, "Unit of work started");
        Ok(Self {
            id,
            tx: Some(tx),
            tracked: Vec::new(),
            index: HashMap::new(),
            interceptors,
            persisted: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Look up a record, preferring the tracked (possibly modified) copy
    pub async fn find(
        &mut self,
        entity_type: &str,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Option<Record>> {
        if let Some(&pos) = self.index.get(&id) {
            let record = &self.tracked[pos].record;
            return Ok(Some(record.clone()).filter(|r| visibility.admits(r)));
        }
        self.tx()?.find(entity_type, id, visibility).await
    }

    /// Foreign-key lookup with tracked copies substituted in
    pub async fn find_by_field(
        &mut self,
        entity_type: &str,
        field: &str,
        value: Uuid,
        visibility: Visibility,
    ) -> Result<Vec<Record>> {
        let fetched = self
            .tx()?
            .find_by_field(entity_type, field, value, Visibility::All)
            .await?;

        Ok(fetched
            .into_iter()
            .map(|r| match self.index.get(&r.id()) {
                Some(&pos) => self.tracked[pos].record.clone(),
                None => r,
            })
            .filter(|r| visibility.admits(r))
            .collect())
    }

    /// Record a modification; the first-seen delete flag is kept as original
    pub fn track_modified(&mut self, original_deleted: bool, record: Record) {
        match self.index.get(&record.id()) {
            Some(&pos) => self.tracked[pos].record = record,
            None => {
                self.index.insert(record.id(), self.tracked.len());
                self.tracked.push(Tracked {
                    original_deleted,
                    record,
                });
            }
        }
    }

    pub fn pending_changes(&self) -> Vec<TrackedChange> {
        self.tracked
            .iter()
            .map(|t| TrackedChange {
                entity_type: t.record.entity_type().to_string(),
                id: t.record.id(),
                was_deleted: t.original_deleted,
                is_deleted: t.record.is_deleted(),
            })
            .collect()
    }

    /// Write tracked changes inside the transaction
    pub async fn save_changes(&mut self) -> Result<u64> {
        if self.tracked.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        for tracked in &mut self.tracked {
            tracked.record.touch(now);
        }

        let changes = self.pending_changes();
        for interceptor in &self.interceptors {
            interceptor.saving_changes(self.id, &changes).await?;
        }

        let records: Vec<Record> = self.tracked.iter().map(|t| t.record.clone()).collect();
        let written = self.tx()?.write(&records).await?;
        self.persisted += written;

        // Saved records become the new baseline
        for tracked in &mut self.tracked {
            tracked.original_deleted = tracked.record.is_deleted();
        }

        debug!(unit_id = %self.id, written, "Unit of work saved");
        Ok(written)
    }

    /// Commit, then run the post-commit hooks.
    ///
    /// A hook failure is returned after every hook has run; the commit
    /// itself stands.
    pub async fn commit(mut self) -> Result<u64> {
        let mut tx = self.take_tx()?;
        if let Err(e) = commit_confirmed(tx.as_mut(), self.id).await {
            self.notify_rolled_back();
            return Err(e);
        }

        let persisted = self.persisted;
        let mut failure = None;
        for interceptor in std::mem::take(&mut self.interceptors) {
            if let Err(e) = interceptor.saved_changes(self.id, persisted).await {
                warn!(unit_id = %self.id, error = %e, "Post-commit hook failed");
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(persisted),
        }
    }

    pub async fn rollback(mut self) -> Result<()> {
        let tx = self.take_tx()?;
        self.notify_rolled_back();
        tx.rollback().await
    }

    fn tx(&mut self) -> Result<&mut Box<dyn StoreTransaction>> {
        self.tx
            .as_mut()
            .ok_or_else(|| CascadeError::Internal("unit of work already finished".into()))
    }

    fn take_tx(&mut self) -> Result<Box<dyn StoreTransaction>> {
        self.tx
            .take()
            .ok_or_else(|| CascadeError::Internal("unit of work already finished".into()))
    }

    fn notify_rolled_back(&mut self) {
        for interceptor in std::mem::take(&mut self.interceptors) {
            interceptor.rolled_back(self.id);
        }
    }
}

/// Commit, re-issuing only the commit while its result is unknown
async fn commit_confirmed(tx: &mut dyn StoreTransaction, unit_id: Uuid) -> Result<()> {
    let mut attempt = 1;
    loop {
        match tx.commit().await {
            Err(e) if e.is_commit_unknown() && attempt < COMMIT_ATTEMPTS => {
                warn!(%unit_id, attempt, error = %e, "Commit result unknown, retrying commit");
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        // Dropped mid-flight (cancelled future or early return)
        if self.tx.is_some() {
            debug!(unit_id = %self.id, "Unit of work dropped without commit");
            self.notify_rolled_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FaultKind, FaultPoint, MemoryStore};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SaveInterceptor for Recorder {
        async fn saving_changes(&self, _unit_id: Uuid, changes: &[TrackedChange]) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("saving:{}", changes.len()));
            Ok(())
        }

        async fn saved_changes(&self, _unit_id: Uuid, persisted: u64) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("saved:{}", persisted));
            Ok(())
        }

        fn rolled_back(&self, _unit_id: Uuid) {
            self.events.lock().unwrap().push("rolled_back".into());
        }
    }

    async fn seeded() -> (MemoryStore, Record) {
        let store = MemoryStore::new();
        let record = Record::new("Item", json!({ "id": Uuid::new_v4().to_string() })).unwrap();
        store.insert(record.clone()).await.unwrap();
        (store, record)
    }

    #[test]
    fn test_change_transition() {
        let change = |was, is| TrackedChange {
            entity_type: "Item".into(),
            id: Uuid::nil(),
            was_deleted: was,
            is_deleted: is,
        };
        assert_eq!(change(false, true).transition(), Some(Transition::SoftDelete));
        assert_eq!(change(true, false).transition(), Some(Transition::Restore));
        assert_eq!(change(true, true).transition(), None);
    }

    #[tokio::test]
    async fn test_hooks_run_in_order_on_commit() {
        let (store, mut record) = seeded().await;
        let recorder = Arc::new(Recorder::default());

        let mut uow = UnitOfWork::begin(&store, vec![recorder.clone() as Arc<dyn SaveInterceptor>]).await.unwrap();
        record.apply(Transition::SoftDelete, None, Utc::now());
        uow.track_modified(false, record.clone());
        assert_eq!(uow.save_changes().await.unwrap(), 1);
        assert_eq!(uow.commit().await.unwrap(), 1);

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["saving:1".to_string(), "saved:1".to_string()]
        );
        let stored = store.find("Item", record.id(), Visibility::All).await.unwrap().unwrap();
        assert!(stored.is_deleted());
        assert!(stored.field("modification_time").is_some());
    }

    #[tokio::test]
    async fn test_failed_commit_notifies_rollback() {
        let (store, mut record) = seeded().await;
        let recorder = Arc::new(Recorder::default());
        store.inject_fault(FaultPoint::Commit, FaultKind::Persistence).await;

        let mut uow = UnitOfWork::begin(&store, vec![recorder.clone() as Arc<dyn SaveInterceptor>]).await.unwrap();
        record.apply(Transition::SoftDelete, None, Utc::now());
        uow.track_modified(false, record.clone());
        uow.save_changes().await.unwrap();
        assert!(uow.commit().await.is_err());

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["saving:1".to_string(), "rolled_back".to_string()]
        );
        let stored = store.find("Item", record.id(), Visibility::All).await.unwrap().unwrap();
        assert!(!stored.is_deleted());
    }

    #[tokio::test]
    async fn test_unknown_commit_result_retries_commit_only() {
        let (store, mut record) = seeded().await;
        let recorder = Arc::new(Recorder::default());
        store.inject_fault(FaultPoint::Commit, FaultKind::CommitUnknown).await;

        let mut uow = UnitOfWork::begin(&store, vec![recorder.clone() as Arc<dyn SaveInterceptor>]).await.unwrap();
        record.apply(Transition::SoftDelete, None, Utc::now());
        uow.track_modified(false, record.clone());
        uow.save_changes().await.unwrap();
        assert_eq!(uow.commit().await.unwrap(), 1);

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["saving:1".to_string(), "saved:1".to_string()]
        );
        assert_eq!(store.transactions_started(), 1);
        assert_eq!(store.commits(), 1);
        let stored = store.find("Item", record.id(), Visibility::All).await.unwrap().unwrap();
        assert!(stored.is_deleted());
    }

    #[tokio::test]
    async fn test_drop_without_commit_notifies_rollback() {
        let (store, _) = seeded().await;
        let recorder = Arc::new(Recorder::default());
        {
            let _uow = UnitOfWork::begin(&store, vec![recorder.clone() as Arc<dyn SaveInterceptor>]).await.unwrap();
        }
        assert_eq!(*recorder.events.lock().unwrap(), vec!["rolled_back".to_string()]);
    }

    #[tokio::test]
    async fn test_find_prefers_tracked_copy() {
        let (store, mut record) = seeded().await;
        let mut uow = UnitOfWork::begin(&store, vec![]).await.unwrap();
        record.apply(Transition::SoftDelete, None, Utc::now());
        uow.track_modified(false, record.clone());

        assert!(uow.find("Item", record.id(), Visibility::Live).await.unwrap().is_none());
        let found = uow.find("Item", record.id(), Visibility::All).await.unwrap().unwrap();
        assert!(found.is_deleted());
        uow.rollback().await.unwrap();
    }
}
