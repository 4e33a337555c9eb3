//! Deletion events and the publisher seam
//!
//! The event shape is identical for in-process and broker delivery; the
//! broker path serializes it as JSON with PascalCase keys.

pub mod bus;
pub mod topics;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::Entity;
use crate::types::Result;

pub use bus::InProcessBus;

/// Reason attached to events produced by a soft-delete
pub const REASON_SOFT_DELETE: &str = "SoftDelete";
/// Reason attached to events produced by a restore
pub const REASON_RESTORE: &str = "Restore";

/// Notification that an entity was logically deleted (or restored)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeletionEvent {
    pub entity_type: String,

    pub entity_id: Uuid,

    /// Service whose commit produced the event
    pub origin_service: String,

    #[serde(default)]
    pub reason: Option<String>,

    /// Shared by every event of one committed unit of work
    pub correlation_id: String,

    pub occurred_at: DateTime<Utc>,

    /// Whether subscribers should cascade further
    pub cascade: bool,
}

impl DeletionEvent {
    /// New cascading event with a fresh correlation id
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: Uuid,
        origin_service: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id,
            origin_service: origin_service.into(),
            reason: None,
            correlation_id: Uuid::new_v4().simple().to_string(),
            occurred_at: Utc::now(),
            cascade: true,
        }
    }

    pub fn for_entity<T: Entity>(entity_id: Uuid, origin_service: impl Into<String>) -> Self {
        Self::new(T::ENTITY_TYPE, entity_id, origin_service)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_cascade(mut self, cascade: bool) -> Self {
        self.cascade = cascade;
        self
    }

    /// Topic this event is published on by default
    pub fn topic(&self) -> String {
        topics::deleted(&self.entity_type)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> std::result::Result<bytes::Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Into::into)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Delivers deletion events to subscribers
#[async_trait]
pub trait DeletionPublisher: Send + Sync {
    /// Publish on an explicit topic
    async fn publish_to(&self, topic: &str, event: DeletionEvent) -> Result<()>;

    /// Publish on `{EntityType}.Deleted`
    async fn publish(&self, event: DeletionEvent) -> Result<()> {
        let topic = event.topic();
        self.publish_to(&topic, event).await
    }
}

/// Typed convenience over any publisher
#[async_trait]
pub trait DeletionPublisherExt: DeletionPublisher {
    /// Build and publish an event for entity type `T`
    async fn publish_for<T: Entity>(
        &self,
        entity_id: Uuid,
        origin_service: &str,
        reason: Option<&str>,
        cascade: bool,
        correlation_id: Option<&str>,
    ) -> Result<()> {
        let mut event = DeletionEvent::for_entity::<T>(entity_id, origin_service)
            .with_cascade(cascade);
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        if let Some(correlation_id) = correlation_id {
            event = event.with_correlation_id(correlation_id);
        }
        self.publish(event).await
    }
}

impl<P: DeletionPublisher + ?Sized> DeletionPublisherExt for P {}

/// Publisher that drops every event, for services that only consume
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl DeletionPublisher for NoopPublisher {
    async fn publish_to(&self, _topic: &str, _event: DeletionEvent) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityMeta;

    #[derive(Serialize, Deserialize)]
    struct Display {
        #[serde(flatten)]
        meta: EntityMeta,
    }

    impl Entity for Display {
        const ENTITY_TYPE: &'static str = "Display";
        fn meta(&self) -> &EntityMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    #[test]
    fn test_wire_shape_uses_pascal_case_keys() {
        let event = DeletionEvent::new("Display", Uuid::nil(), "Batch")
            .with_reason(REASON_SOFT_DELETE)
            .with_correlation_id("abc");
        let json: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();

        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "Cascade",
                "CorrelationId",
                "EntityId",
                "EntityType",
                "OccurredAt",
                "OriginService",
                "Reason"
            ]
        );
        assert_eq!(json["EntityType"], "Display");
        assert_eq!(json["Cascade"], true);
    }

    #[test]
    fn test_missing_reason_decodes_as_none() {
        let raw = format!(
            r#"{{"EntityType":"Display","EntityId":"{}","OriginService":"Batch","CorrelationId":"c","OccurredAt":"2024-01-01T00:00:00Z","Cascade":false}}"#,
            Uuid::nil()
        );
        let event = DeletionEvent::from_bytes(raw.as_bytes()).unwrap();
        assert!(event.reason.is_none());
        assert!(!event.cascade);
        assert_eq!(event.topic(), "Display.Deleted");
    }

    #[tokio::test]
    async fn test_publish_for_builds_typed_event() {
        let bus = InProcessBus::default();
        let mut rx = bus.subscribe("Display.Deleted");
        let id = Uuid::new_v4();

        bus.publish_for::<Display>(id, "Batch", Some("manual"), false, Some("corr"))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.entity_type, "Display");
        assert_eq!(event.entity_id, id);
        assert_eq!(event.reason.as_deref(), Some("manual"));
        assert_eq!(event.correlation_id, "corr");
        assert!(!event.cascade);
    }
}
