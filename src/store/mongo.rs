//! MongoDB-backed store
//!
//! One collection per entity type, `_id` holding the entity id as a string.
//! Cascades run inside a client session transaction; errors carrying the
//! server's transient labels come back as `CascadeError::Transient` so the
//! execution strategy replays them.

use bson::{doc, Bson, Document};
use mongodb::{options::IndexOptions, Client, ClientSession, Collection, Database, IndexModel};
use tracing::{debug, info};
use uuid::Uuid;

use async_trait::async_trait;

use super::{Store, StoreTransaction, Visibility};
use crate::entity::{Record, IS_DELETED_FIELD};
use crate::types::{CascadeError, Result};

/// MongoDB store wrapper
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db_name: String,
}

impl MongoStore {
    /// Connect and verify the server answers a ping
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB at {}", uri);

        // Use serverSelectionTimeoutMS to avoid hanging on unreachable MongoDB
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri).await.map_err(|e| {
            CascadeError::Persistence(format!("Failed to connect to MongoDB: {}", e))
        })?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| CascadeError::Persistence(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Index a foreign-key field so child lookups stay cheap
    pub async fn ensure_index(&self, entity_type: &str, field: &str) -> Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { field: 1 })
            .options(Some(
                IndexOptions::builder()
                    .name(format!("{}_cascade", field))
                    .build(),
            ))
            .build();

        self.collection(entity_type)
            .create_index(index)
            .await
            .map_err(|e| CascadeError::Persistence(format!("Failed to create index: {}", e)))?;

        debug!(entity_type, field, "Foreign-key index ensured");
        Ok(())
    }

    fn database(&self) -> Database {
        self.client.database(&self.db_name)
    }

    fn collection(&self, entity_type: &str) -> Collection<Document> {
        self.database().collection(entity_type)
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        Ok(Box::new(MongoTransaction {
            db: self.database(),
            session,
        }))
    }

    async fn find(
        &self,
        entity_type: &str,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Option<Record>> {
        let filter = with_visibility(doc! { "_id": id.to_string() }, visibility);
        match self.collection(entity_type).find_one(filter).await? {
            Some(document) => Ok(Some(to_record(entity_type, document)?)),
            None => Ok(None),
        }
    }

    async fn find_by_field(
        &self,
        entity_type: &str,
        field: &str,
        value: Uuid,
        visibility: Visibility,
    ) -> Result<Vec<Record>> {
        use futures_util::TryStreamExt;

        let filter = with_visibility(doc! { field: value.to_string() }, visibility);
        let documents: Vec<Document> = self
            .collection(entity_type)
            .find(filter)
            .await?
            .try_collect()
            .await?;

        documents
            .into_iter()
            .map(|d| to_record(entity_type, d))
            .collect()
    }

    async fn insert(&self, record: Record) -> Result<()> {
        let entity_type = record.entity_type().to_string();
        self.collection(&entity_type)
            .insert_one(to_document(&record)?)
            .await?;
        Ok(())
    }
}

struct MongoTransaction {
    db: Database,
    session: ClientSession,
}

#[async_trait]
impl StoreTransaction for MongoTransaction {
    async fn find(
        &mut self,
        entity_type: &str,
        id: Uuid,
        visibility: Visibility,
    ) -> Result<Option<Record>> {
        let filter = with_visibility(doc! { "_id": id.to_string() }, visibility);
        let found = self
            .db
            .collection::<Document>(entity_type)
            .find_one(filter)
            .session(&mut self.session)
            .await?;
        match found {
            Some(document) => Ok(Some(to_record(entity_type, document)?)),
            None => Ok(None),
        }
    }

    async fn find_by_field(
        &mut self,
        entity_type: &str,
        field: &str,
        value: Uuid,
        visibility: Visibility,
    ) -> Result<Vec<Record>> {
        let filter = with_visibility(doc! { field: value.to_string() }, visibility);
        let mut cursor = self
            .db
            .collection::<Document>(entity_type)
            .find(filter)
            .session(&mut self.session)
            .await?;

        let mut records = Vec::new();
        while let Some(document) = cursor.next(&mut self.session).await {
            records.push(to_record(entity_type, document?)?);
        }
        Ok(records)
    }

    async fn write(&mut self, records: &[Record]) -> Result<u64> {
        let mut persisted = 0;
        for record in records {
            let result = self
                .db
                .collection::<Document>(record.entity_type())
                .replace_one(doc! { "_id": record.id().to_string() }, to_document(record)?)
                .session(&mut self.session)
                .await?;
            persisted += result.modified_count;
        }
        Ok(persisted)
    }

    async fn commit(&mut self) -> Result<()> {
        // Retrying commit_transaction after an unknown result is safe
        self.session.commit_transaction().await?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.session.abort_transaction().await?;
        Ok(())
    }
}

fn with_visibility(mut filter: Document, visibility: Visibility) -> Document {
    if visibility == Visibility::Live {
        filter.insert(IS_DELETED_FIELD, doc! { "$ne": true });
    }
    filter
}

fn to_document(record: &Record) -> Result<Document> {
    let mut document = bson::to_document(record.document())?;
    document.insert("_id", record.id().to_string());
    Ok(document)
}

fn to_record(entity_type: &str, mut document: Document) -> Result<Record> {
    document.remove("_id");
    Record::new(entity_type, Bson::Document(document).into_relaxed_extjson())
}
