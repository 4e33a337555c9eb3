//! Persistence surface consumed by the cascade engine
//!
//! The engine never talks to a database directly. It needs lookup by id,
//! lookup by foreign key, transactional writes, and the ability to bypass
//! the default "hide deleted rows" filter. [`Store`] and
//! [`StoreTransaction`] capture exactly that; [`UnitOfWork`] adds change
//! tracking and the save hooks that change capture plugs into.

pub mod memory;
pub mod mongo;
pub mod unit_of_work;

use async_trait::async_trait;
use uuid::Uuid;

use crate::entity::Record;
use crate::types::Result;

pub use memory::{FaultKind, FaultPoint, MemoryStore};
pub use mongo::MongoStore;
pub use unit_of_work::{SaveInterceptor, TrackedChange, UnitOfWork};

/// Row visibility for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Default filter: logically deleted rows are hidden
    Live,
    /// Filter bypassed: deleted rows are returned too
    All,
}

impl Visibility {
    pub fn admits(self, record: &Record) -> bool {
        match self {
            Self::Live => !record.is_deleted(),
            Self::All => true,
        }
    }
}

/// A database holding soft-deletable records
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Non-transactional lookup, used to resolve roots before a transaction opens
    async fn find(&self, entity_type: &str, id: Uuid, visibility: Visibility)
        -> Result<Option<Record>>;

    /// Non-transactional foreign-key lookup
    async fn find_by_field(
        &self,
        entity_type: &str,
        field: &str,
        value: Uuid,
        visibility: Visibility,
    ) -> Result<Vec<Record>>;

    async fn insert(&self, record: Record) -> Result<()>;
}

/// One open transaction; dropping it without commit discards its writes
#[async_trait]
pub trait StoreTransaction: Send {
    async fn find(
        &mut self,
        entity_type: &str,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Option<Record>>;

    async fn find_by_field(
        &mut self,
        entity_type: &str,
        field: &str,
        value: Uuid,
        visibility: Visibility,
    ) -> Result<Vec<Record>>;

    /// Write modified records; returns the number of rows persisted
    async fn write(&mut self, records: &[Record]) -> Result<u64>;

    /// Commit the transaction.
    ///
    /// `Transient` means nothing was applied. `CommitUnknown` means the
    /// outcome is unconfirmed; `commit` may then be called again and must
    /// not apply the writes twice.
    async fn commit(&mut self) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
