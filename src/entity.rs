//! Entity model shared by every soft-deletable record
//!
//! Domain structs flatten [`EntityMeta`] and implement [`Entity`]. The
//! cascade engine walks heterogeneous graphs, so it handles records in
//! their type-erased [`Record`] form and only decodes to the typed struct
//! where a registered closure needs it.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::{CascadeError, Result};

pub const ID_FIELD: &str = "id";
pub const MODIFICATION_TIME_FIELD: &str = "modification_time";
pub const IS_DELETED_FIELD: &str = "is_deleted";
pub const DELETED_AT_FIELD: &str = "deleted_at";
pub const DELETED_BY_FIELD: &str = "deleted_by";

/// Common metadata for all entities
///
/// `deleted_at` and `deleted_by` are only ever set while `is_deleted` is true.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EntityMeta {
    pub id: Uuid,

    pub creation_time: DateTime<Utc>,

    pub modification_time: DateTime<Utc>,

    /// Whether this entity has been soft-deleted
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deleted_by: Option<String>,
}

impl EntityMeta {
    /// Create live metadata with a fresh id and current timestamps
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            creation_time: now,
            modification_time: now,
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
        }
    }
}

impl Default for EntityMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A persisted, soft-deletable domain type
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Runtime type name, also used for topics and collections
    const ENTITY_TYPE: &'static str;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn id(&self) -> Uuid {
        self.meta().id
    }
}

/// Direction of a delete-flag change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    SoftDelete,
    Restore,
}

impl Transition {
    /// Value of `is_deleted` once the transition has applied
    pub fn target_flag(self) -> bool {
        matches!(self, Self::SoftDelete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SoftDelete => "SoftDelete",
            Self::Restore => "Restore",
        }
    }
}

/// Type-erased entity document as stored and traversed
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    entity_type: String,
    id: Uuid,
    document: Map<String, Value>,
}

impl Record {
    /// Wrap a JSON object; it must carry a UUID `id` field
    pub fn new(entity_type: impl Into<String>, document: Value) -> Result<Self> {
        let entity_type = entity_type.into();
        let document = match document {
            Value::Object(map) => map,
            other => {
                return Err(CascadeError::Serialization(format!(
                    "{} document is not an object: {}",
                    entity_type, other
                )))
            }
        };

        let id = document
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                CascadeError::Serialization(format!("{} document has no valid id", entity_type))
            })?;

        Ok(Self {
            entity_type,
            id,
            document,
        })
    }

    pub fn from_entity<T: Entity>(entity: &T) -> Result<Self> {
        Self::new(T::ENTITY_TYPE, serde_json::to_value(entity)?)
    }

    /// Decode into the typed entity; fails if the record is of another type
    pub fn decode<T: Entity>(&self) -> Result<T> {
        if self.entity_type != T::ENTITY_TYPE {
            return Err(CascadeError::Serialization(format!(
                "record of type {} cannot decode as {}",
                self.entity_type,
                T::ENTITY_TYPE
            )));
        }
        Ok(serde_json::from_value(Value::Object(self.document.clone()))?)
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.document.get(name)
    }

    /// Read a field holding a UUID string; `None` when absent, null or malformed
    pub fn uuid_field(&self, name: &str) -> Option<Uuid> {
        self.field(name)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn is_deleted(&self) -> bool {
        self.field(IS_DELETED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.field(DELETED_AT_FIELD)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn deleted_by(&self) -> Option<&str> {
        self.field(DELETED_BY_FIELD).and_then(Value::as_str)
    }

    /// Flip the delete flag toward `transition`'s target.
    ///
    /// Returns false (and leaves the record untouched) when the flag is
    /// already in the target state.
    pub(crate) fn apply(
        &mut self,
        transition: Transition,
        actor: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_deleted() == transition.target_flag() {
            return false;
        }

        match transition {
            Transition::SoftDelete => {
                self.document
                    .insert(IS_DELETED_FIELD.to_string(), Value::Bool(true));
                self.document
                    .insert(DELETED_AT_FIELD.to_string(), timestamp_value(now));
                self.document.insert(
                    DELETED_BY_FIELD.to_string(),
                    actor.map_or(Value::Null, |a| Value::String(a.to_string())),
                );
            }
            Transition::Restore => {
                self.document
                    .insert(IS_DELETED_FIELD.to_string(), Value::Bool(false));
                self.document.insert(DELETED_AT_FIELD.to_string(), Value::Null);
                self.document.insert(DELETED_BY_FIELD.to_string(), Value::Null);
            }
        }
        true
    }

    /// Stamp the modification time
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.document
            .insert(MODIFICATION_TIME_FIELD.to_string(), timestamp_value(now));
    }
}

fn timestamp_value(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct Widget {
        #[serde(flatten)]
        meta: EntityMeta,
        name: String,
        owner_id: Option<Uuid>,
    }

    impl Entity for Widget {
        const ENTITY_TYPE: &'static str = "Widget";

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    fn widget() -> Widget {
        Widget {
            meta: EntityMeta::new(),
            name: "w".into(),
            owner_id: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn test_record_keeps_identity_and_fields() {
        let w = widget();
        let record = Record::from_entity(&w).unwrap();
        assert_eq!(record.entity_type(), "Widget");
        assert_eq!(record.id(), w.id());
        assert_eq!(record.uuid_field("owner_id"), w.owner_id);
        assert!(!record.is_deleted());

        let decoded: Widget = record.decode().unwrap();
        assert_eq!(decoded.name, "w");
        assert_eq!(decoded.meta, w.meta);
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        let err = Record::new("Widget", serde_json::json!({ "name": "x" })).unwrap_err();
        assert!(matches!(err, CascadeError::Serialization(_)));
        assert!(Record::new("Widget", serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_apply_sets_and_clears_deletion_fields_together() {
        let mut record = Record::from_entity(&widget()).unwrap();
        let now = Utc::now();

        assert!(record.apply(Transition::SoftDelete, Some("alice"), now));
        assert!(record.is_deleted());
        assert!(record.deleted_at().is_some());
        assert_eq!(record.deleted_by(), Some("alice"));

        assert!(!record.apply(Transition::SoftDelete, Some("bob"), now));
        assert_eq!(record.deleted_by(), Some("alice"));

        assert!(record.apply(Transition::Restore, Some("bob"), now));
        assert!(!record.is_deleted());
        assert!(record.deleted_at().is_none());
        assert!(record.deleted_by().is_none());

        let decoded: Widget = record.decode().unwrap();
        assert!(!decoded.meta.is_deleted);
        assert!(decoded.meta.deleted_at.is_none());
    }

    #[test]
    fn test_decode_checks_type() {
        let record = Record::new(
            "Gadget",
            serde_json::to_value(widget()).unwrap(),
        )
        .unwrap();
        assert!(record.decode::<Widget>().is_err());
    }
}
