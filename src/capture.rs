//! Change capture
//!
//! A [`SaveInterceptor`] that notices delete-flag transitions while a unit
//! of work saves and publishes them once the transaction has committed.
//! Staging is keyed by unit-of-work id and lives for exactly one unit of
//! work: it is cleared after commit (whether or not publishing succeeds)
//! and on rollback, so a replayed attempt starts clean.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, error};
use uuid::Uuid;

use crate::entity::Transition;
use crate::events::{topics, DeletionEvent, DeletionPublisher, REASON_RESTORE, REASON_SOFT_DELETE};
use crate::store::{SaveInterceptor, TrackedChange};
use crate::types::Result;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Stamped on every event as `OriginService`
    pub origin_service: String,
    /// Also announce restores on `{EntityType}.Restored`
    pub propagate_restores: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            origin_service: "softcascade".to_string(),
            propagate_restores: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedChange {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub transition: Transition,
}

impl StagedChange {
    fn into_event(self, origin_service: &str, correlation_id: &str) -> (String, DeletionEvent) {
        let (topic, reason) = match self.transition {
            Transition::SoftDelete => (topics::deleted(&self.entity_type), REASON_SOFT_DELETE),
            Transition::Restore => (topics::restored(&self.entity_type), REASON_RESTORE),
        };
        let event = DeletionEvent::new(self.entity_type, self.entity_id, origin_service)
            .with_reason(reason)
            .with_correlation_id(correlation_id)
            .with_cascade(true);
        (topic, event)
    }
}

pub struct ChangeCapture {
    config: CaptureConfig,
    publisher: Arc<dyn DeletionPublisher>,
    staged: DashMap<Uuid, Vec<StagedChange>>,
}

impl ChangeCapture {
    pub fn new(config: CaptureConfig, publisher: Arc<dyn DeletionPublisher>) -> Self {
        Self {
            config,
            publisher,
            staged: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Units of work currently holding staged changes
    pub fn staged_units(&self) -> usize {
        self.staged.len()
    }

    fn select(&self, change: &TrackedChange) -> Option<StagedChange> {
        let transition = change.transition()?;
        if transition == Transition::Restore && !self.config.propagate_restores {
            return None;
        }
        Some(StagedChange {
            entity_type: change.entity_type.clone(),
            entity_id: change.id,
            transition,
        })
    }
}

#[async_trait]
impl SaveInterceptor for ChangeCapture {
    async fn saving_changes(&self, unit_id: Uuid, changes: &[TrackedChange]) -> Result<()> {
        let selected: Vec<StagedChange> = changes.iter().filter_map(|c| self.select(c)).collect();
        if !selected.is_empty() {
            debug!(%unit_id, staged = selected.len(), "Staging delete-flag transitions");
            self.staged.entry(unit_id).or_default().extend(selected);
        }
        Ok(())
    }

    async fn saved_changes(&self, unit_id: Uuid, persisted: u64) -> Result<()> {
        let Some((_, staged)) = self.staged.remove(&unit_id) else {
            return Ok(());
        };
        if persisted == 0 {
            debug!(%unit_id, "Nothing persisted, discarding staged events");
            return Ok(());
        }

        let correlation_id = unit_id.simple().to_string();
        let mut failure = None;
        for change in staged {
            let (topic, event) = change.into_event(&self.config.origin_service, &correlation_id);
            let entity_id = event.entity_id;
            if let Err(e) = self.publisher.publish_to(&topic, event).await {
                error!(%topic, %entity_id, error = %e, "Failed to publish deletion event");
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn rolled_back(&self, unit_id: Uuid) {
        if self.staged.remove(&unit_id).is_some() {
            debug!(%unit_id, "Discarded staged events of rolled-back unit of work");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcessBus;
    use crate::types::CascadeError;

    fn change(was_deleted: bool, is_deleted: bool) -> TrackedChange {
        TrackedChange {
            entity_type: "Display".into(),
            id: Uuid::new_v4(),
            was_deleted,
            is_deleted,
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl DeletionPublisher for FailingPublisher {
        async fn publish_to(&self, _topic: &str, _event: DeletionEvent) -> Result<()> {
            Err(CascadeError::Publish {
                attempts: 1,
                message: "down".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_only_soft_deletes_staged_by_default() {
        let bus = Arc::new(InProcessBus::default());
        let mut deleted = bus.subscribe("*.Deleted");
        let mut restored = bus.subscribe("*.Restored");
        let capture = ChangeCapture::new(CaptureConfig::default(), bus.clone());
        let unit = Uuid::new_v4();

        capture
            .saving_changes(unit, &[change(false, true), change(true, false), change(true, true)])
            .await
            .unwrap();
        capture.saved_changes(unit, 3).await.unwrap();

        let event = deleted.recv().await.unwrap();
        assert_eq!(event.correlation_id, unit.simple().to_string());
        assert_eq!(event.reason.as_deref(), Some("SoftDelete"));
        assert!(event.cascade);
        assert!(deleted.try_recv().is_err());
        assert!(restored.try_recv().is_err());
        assert_eq!(capture.staged_units(), 0);
    }

    #[tokio::test]
    async fn test_restores_published_when_enabled() {
        let bus = Arc::new(InProcessBus::default());
        let mut restored = bus.subscribe("Display.Restored");
        let config = CaptureConfig {
            origin_service: "Batch".into(),
            propagate_restores: true,
        };
        let capture = ChangeCapture::new(config, bus.clone());
        let unit = Uuid::new_v4();

        capture.saving_changes(unit, &[change(true, false)]).await.unwrap();
        capture.saved_changes(unit, 1).await.unwrap();

        let event = restored.recv().await.unwrap();
        assert_eq!(event.reason.as_deref(), Some("Restore"));
        assert_eq!(event.origin_service, "Batch");
    }

    #[tokio::test]
    async fn test_nothing_persisted_publishes_nothing() {
        let bus = Arc::new(InProcessBus::default());
        let mut deleted = bus.subscribe("*.Deleted");
        let capture = ChangeCapture::new(CaptureConfig::default(), bus.clone());
        let unit = Uuid::new_v4();

        capture.saving_changes(unit, &[change(false, true)]).await.unwrap();
        capture.saved_changes(unit, 0).await.unwrap();

        assert!(deleted.try_recv().is_err());
        assert_eq!(capture.staged_units(), 0);
    }

    #[tokio::test]
    async fn test_staging_cleared_on_publish_failure_and_rollback() {
        let capture = ChangeCapture::new(CaptureConfig::default(), Arc::new(FailingPublisher));

        let unit = Uuid::new_v4();
        capture.saving_changes(unit, &[change(false, true)]).await.unwrap();
        let err = capture.saved_changes(unit, 1).await.unwrap_err();
        assert!(matches!(err, CascadeError::Publish { .. }));
        assert_eq!(capture.staged_units(), 0);

        let aborted = Uuid::new_v4();
        capture.saving_changes(aborted, &[change(false, true)]).await.unwrap();
        assert_eq!(capture.staged_units(), 1);
        capture.rolled_back(aborted);
        assert_eq!(capture.staged_units(), 0);
    }
}
