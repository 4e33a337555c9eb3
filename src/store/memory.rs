//! In-memory store
//!
//! Tables keep insertion order so traversal output is deterministic.
//! Transactions buffer writes in an overlay that is applied on commit and
//! discarded on rollback or drop. Faults can be queued to exercise the
//! rollback and replay paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::{Store, StoreTransaction, Visibility};
use crate::entity::{Entity, Record};
use crate::types::{CascadeError, Result};

/// Where a queued fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Lookup,
    Write,
    Commit,
}

/// What a queued fault looks like to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Persistence,
    /// At commit: the writes are applied, then reported as unconfirmed
    CommitUnknown,
}

impl FaultKind {
    fn into_error(self, point: FaultPoint) -> CascadeError {
        match self {
            Self::Transient => CascadeError::Transient(format!("injected fault at {:?}", point)),
            Self::Persistence => {
                CascadeError::Persistence(format!("injected fault at {:?}", point))
            }
            Self::CommitUnknown => {
                CascadeError::CommitUnknown(format!("injected fault at {:?}", point))
            }
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    tables: RwLock<HashMap<String, Vec<Record>>>,
    faults: Mutex<VecDeque<(FaultPoint, FaultKind)>>,
    transactions_started: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryInner {
    /// Pop the first queued fault for `point`, if any
    async fn take_fault(&self, point: FaultPoint) -> Option<FaultKind> {
        let mut faults = self.faults.lock().await;
        let pos = faults.iter().position(|(p, _)| *p == point)?;
        faults.remove(pos).map(|(_, kind)| kind)
    }

    async fn check_fault(&self, point: FaultPoint) -> Result<()> {
        match self.take_fault(point).await {
            Some(kind) => Err(kind.into_error(point)),
            None => Ok(()),
        }
    }

    async fn get(&self, entity_type: &str, id: Uuid) -> Option<Record> {
        let tables = self.tables.read().await;
        tables
            .get(entity_type)
            .and_then(|rows| rows.iter().find(|r| r.id() == id).cloned())
    }

    async fn scan(&self, entity_type: &str, field: &str, value: Uuid) -> Vec<Record> {
        let tables = self.tables.read().await;
        tables
            .get(entity_type)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.uuid_field(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Shared, cloneable in-memory database
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a typed entity
    pub async fn insert_entity<T: Entity>(&self, entity: &T) -> Result<()> {
        self.insert(Record::from_entity(entity)?).await
    }

    /// Read a typed entity regardless of its delete flag
    pub async fn get<T: Entity>(&self, id: Uuid) -> Result<Option<T>> {
        match self.inner.get(T::ENTITY_TYPE, id).await {
            Some(record) => record.decode().map(Some),
            None => Ok(None),
        }
    }

    /// Snapshot of a table in insertion order, deleted rows included
    pub async fn records(&self, entity_type: &str) -> Vec<Record> {
        self.inner
            .tables
            .read()
            .await
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Queue a fault; the next operation reaching `point` fails with it
    pub async fn inject_fault(&self, point: FaultPoint, kind: FaultKind) {
        self.inner.faults.lock().await.push_back((point, kind));
    }

    pub async fn fail_next_commit(&self, kind: FaultKind) {
        self.inject_fault(FaultPoint::Commit, kind).await;
    }

    pub fn transactions_started(&self) -> usize {
        self.inner.transactions_started.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        self.inner.transactions_started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            overlay: HashMap::new(),
            committed: false,
        }))
    }

    async fn find(
        &self,
        entity_type: &str,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Option<Record>> {
        self.inner.check_fault(FaultPoint::Lookup).await?;
        Ok(self
            .inner
            .get(entity_type, id)
            .await
            .filter(|r| visibility.admits(r)))
    }

    async fn find_by_field(
        &self,
        entity_type: &str,
        field: &str,
        value: Uuid,
        visibility: Visibility,
    ) -> Result<Vec<Record>> {
        self.inner.check_fault(FaultPoint::Lookup).await?;
        let mut rows = self.inner.scan(entity_type, field, value).await;
        rows.retain(|r| visibility.admits(r));
        Ok(rows)
    }

    async fn insert(&self, record: Record) -> Result<()> {
        let mut tables = self.inner.tables.write().await;
        let rows = tables.entry(record.entity_type().to_string()).or_default();
        if rows.iter().any(|r| r.id() == record.id()) {
            return Err(CascadeError::Persistence(format!(
                "duplicate {} id {}",
                record.entity_type(),
                record.id()
            )));
        }
        rows.push(record);
        Ok(())
    }
}

struct MemoryTransaction {
    inner: Arc<MemoryInner>,
    overlay: HashMap<(String, Uuid), Record>,
    committed: bool,
}

impl MemoryTransaction {
    fn overlaid(&self, record: Record) -> Record {
        self.overlay
            .get(&(record.entity_type().to_string(), record.id()))
            .cloned()
            .unwrap_or(record)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find(
        &mut self,
        entity_type: &str,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Option<Record>> {
        self.inner.check_fault(FaultPoint::Lookup).await?;
        let found = match self.overlay.get(&(entity_type.to_string(), id)) {
            Some(record) => Some(record.clone()),
            None => self.inner.get(entity_type, id).await,
        };
        Ok(found.filter(|r| visibility.admits(r)))
    }

    async fn find_by_field(
        &mut self,
        entity_type: &str,
        field: &str,
        value: Uuid,
        visibility: Visibility,
    ) -> Result<Vec<Record>> {
        self.inner.check_fault(FaultPoint::Lookup).await?;
        let rows = self.inner.scan(entity_type, field, value).await;
        Ok(rows
            .into_iter()
            .map(|r| self.overlaid(r))
            .filter(|r| r.uuid_field(field) == Some(value) && visibility.admits(r))
            .collect())
    }

    async fn write(&mut self, records: &[Record]) -> Result<u64> {
        self.inner.check_fault(FaultPoint::Write).await?;
        for record in records {
            self.overlay.insert(
                (record.entity_type().to_string(), record.id()),
                record.clone(),
            );
        }
        Ok(records.len() as u64)
    }

    async fn commit(&mut self) -> Result<()> {
        // Repeated commit after an unconfirmed result
        if self.committed {
            return Ok(());
        }

        let fault = self.inner.take_fault(FaultPoint::Commit).await;
        if let Some(kind) = fault.filter(|k| *k != FaultKind::CommitUnknown) {
            return Err(kind.into_error(FaultPoint::Commit));
        }

        let overlay = std::mem::take(&mut self.overlay);
        let applied = overlay.len();
        let mut tables = self.inner.tables.write().await;
        for ((entity_type, id), record) in overlay {
            let rows = tables.entry(entity_type).or_default();
            match rows.iter_mut().find(|r| r.id() == id) {
                Some(row) => *row = record,
                None => rows.push(record),
            }
        }
        drop(tables);
        self.committed = true;
        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        debug!(rows = applied, "Memory transaction committed");

        match fault {
            Some(kind) => Err(kind.into_error(FaultPoint::Commit)),
            None => Ok(()),
        }
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        debug!(rows = self.overlay.len(), "Memory transaction rolled back");
        Ok(())
    }
}
