//! Deletion subscriptions
//!
//! Maps topics (or short aliases such as `OnDisplayDelete`) to ordered
//! handler lists. Besides hand-written handlers, two standard handlers can
//! be derived from a declared relationship:
//!
//! - foreign-key cascade: soft-delete every local `T` whose foreign key
//!   holds the deleted entity's id
//! - policy cascade: soft-delete the local copy of the deleted entity and
//!   whatever the local policy registry reaches from it
//!
//! Dispatch runs handlers sequentially; a failing or panicking handler is
//! logged and does not stop its siblings.

pub mod listener;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info};

use crate::engine::{CascadeEngine, CascadeScope, Root};
use crate::entity::{Entity, Transition};
use crate::events::{topics, DeletionEvent};
use crate::store::Visibility;
use crate::types::{CascadeError, Result};

pub use listener::InProcessListener;

#[async_trait]
pub trait DeletionHandler: Send + Sync {
    async fn handle(&self, event: &DeletionEvent) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> DeletionHandler for FnHandler<F>
where
    F: Fn(DeletionEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: &DeletionEvent) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn DeletionHandler>
where
    F: Fn(DeletionEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Actor recorded on cascades triggered by a remote event
fn remote_actor(event: &DeletionEvent) -> &str {
    &event.origin_service
}

fn scope_for(event: &DeletionEvent) -> CascadeScope {
    if event.cascade {
        CascadeScope::Cascade
    } else {
        CascadeScope::RootOnly
    }
}

fn transition_for(topic: &str) -> Transition {
    if topics::is_restore_topic(topic) {
        Transition::Restore
    } else {
        Transition::SoftDelete
    }
}

/// Cascade over local rows referencing the deleted entity by foreign key
struct ForeignKeyCascade {
    engine: Arc<CascadeEngine>,
    local_type: String,
    foreign_key: String,
    transition: Transition,
}

#[async_trait]
impl DeletionHandler for ForeignKeyCascade {
    async fn handle(&self, event: &DeletionEvent) -> Result<()> {
        let matches = self
            .engine
            .store()
            .find_by_field(
                &self.local_type,
                &self.foreign_key,
                event.entity_id,
                Visibility::All,
            )
            .await?;

        let pending: Vec<_> = matches
            .into_iter()
            .filter(|r| r.is_deleted() != self.transition.target_flag())
            .collect();

        debug!(
            local_type = %self.local_type,
            foreign_key = %self.foreign_key,
            remote_id = %event.entity_id,
            matches = pending.len(),
            "Applying foreign-key cascade"
        );

        let mut failure = None;
        for record in pending {
            let id = record.id();
            let outcome = self
                .engine
                .apply(
                    Root::record(record),
                    Some(remote_actor(event)),
                    self.transition,
                    scope_for(event),
                )
                .await;
            if let Err(e) = outcome {
                error!(local_type = %self.local_type, %id, error = %e, "Foreign-key cascade failed");
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Cascade from the local copy of the deleted entity through local policies
struct PolicyCascade {
    engine: Arc<CascadeEngine>,
    entity_type: String,
    transition: Transition,
}

#[async_trait]
impl DeletionHandler for PolicyCascade {
    async fn handle(&self, event: &DeletionEvent) -> Result<()> {
        let root = Root::by_type(self.entity_type.clone(), event.entity_id);
        match self
            .engine
            .apply(root, Some(remote_actor(event)), self.transition, scope_for(event))
            .await
        {
            Ok(touched) => {
                debug!(entity_type = %self.entity_type, touched = touched.len(), "Policy cascade applied");
                Ok(())
            }
            Err(CascadeError::NotFound { .. }) => {
                debug!(
                    entity_type = %self.entity_type,
                    id = %event.entity_id,
                    "No local copy, nothing to cascade"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

struct Subscription {
    topic: String,
    handlers: Vec<Arc<dyn DeletionHandler>>,
}

/// Topic to handler table, built at startup
#[derive(Default)]
pub struct SubscriptionRegistry {
    aliases: HashMap<String, String>,
    subscriptions: Vec<Subscription>,
    include_restores: bool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a short name onto a topic, overriding the `On{Type}Delete` convention
    pub fn with_alias(mut self, alias: &str, topic: &str) -> Self {
        self.aliases.insert(alias.to_string(), topic.to_string());
        self
    }

    /// Derived handlers also bind `.Restored` and apply restores
    pub fn with_restores(mut self, include_restores: bool) -> Self {
        self.include_restores = include_restores;
        self
    }

    /// Canonical topic for a topic or alias
    pub fn resolve(&self, topic_or_alias: &str) -> String {
        if let Some(topic) = self.aliases.get(topic_or_alias) {
            return topic.clone();
        }
        topics::expand_alias(topic_or_alias).unwrap_or_else(|| topic_or_alias.to_string())
    }

    /// Append a handler; returns the canonical topic it was bound to
    pub fn subscribe(&mut self, topic_or_alias: &str, handler: Arc<dyn DeletionHandler>) -> String {
        let topic = self.resolve(topic_or_alias);
        match self.subscriptions.iter_mut().find(|s| s.topic == topic) {
            Some(subscription) => subscription.handlers.push(handler),
            None => self.subscriptions.push(Subscription {
                topic: topic.clone(),
                handlers: vec![handler],
            }),
        }
        debug!(%topic, "Deletion handler registered");
        topic
    }

    pub fn subscribe_fn<F, Fut>(&mut self, topic_or_alias: &str, f: F) -> String
    where
        F: Fn(DeletionEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(topic_or_alias, handler_fn(f))
    }

    /// Cascade every local `T` whose `foreign_key` references the deleted entity
    pub fn subscribe_foreign_key<T: Entity>(
        &mut self,
        topic_or_alias: &str,
        foreign_key: &str,
        engine: Arc<CascadeEngine>,
    ) -> Vec<String> {
        self.subscribe_foreign_key_by_name(topic_or_alias, T::ENTITY_TYPE, foreign_key, engine)
    }

    /// Foreign-key cascade declared by type name, for subscriptions read from configuration
    pub fn subscribe_foreign_key_by_name(
        &mut self,
        topic_or_alias: &str,
        local_type: &str,
        foreign_key: &str,
        engine: Arc<CascadeEngine>,
    ) -> Vec<String> {
        let bound = self.derived_topics(topic_or_alias);
        for topic in &bound {
            let handler = Arc::new(ForeignKeyCascade {
                engine: engine.clone(),
                local_type: local_type.to_string(),
                foreign_key: foreign_key.to_string(),
                transition: transition_for(topic),
            });
            self.subscribe(topic, handler);
        }
        info!(local_type, foreign_key, topics = ?bound, "Foreign-key cascade subscribed");
        bound
    }

    /// Mirror deletions of `P` from another service onto the local copy of `P`
    pub fn subscribe_for_policy<P: Entity>(&mut self, engine: Arc<CascadeEngine>) -> Vec<String> {
        let bound = self.derived_topics(&topics::deleted_for::<P>());
        for topic in &bound {
            let handler = Arc::new(PolicyCascade {
                engine: engine.clone(),
                entity_type: P::ENTITY_TYPE.to_string(),
                transition: transition_for(topic),
            });
            self.subscribe(topic, handler);
        }
        info!(entity_type = P::ENTITY_TYPE, topics = ?bound, "Policy cascade subscribed");
        bound
    }

    /// Subscribed topics in first-registration order
    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.iter().map(|s| s.topic.clone()).collect()
    }

    /// Handlers bound to exactly `topic`
    pub fn handlers_on(&self, topic: &str) -> Vec<Arc<dyn DeletionHandler>> {
        self.subscriptions
            .iter()
            .find(|s| s.topic == topic)
            .map(|s| s.handlers.clone())
            .unwrap_or_default()
    }

    /// Handlers of every subscribed pattern matching a concrete topic
    pub fn handlers_for(&self, topic: &str) -> Vec<Arc<dyn DeletionHandler>> {
        self.subscriptions
            .iter()
            .filter(|s| topics::matches(&s.topic, topic))
            .flat_map(|s| s.handlers.iter().cloned())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn derived_topics(&self, topic_or_alias: &str) -> Vec<String> {
        let topic = self.resolve(topic_or_alias);
        let mut bound = vec![topic.clone()];
        if self.include_restores {
            if let Some((entity_type, topics::DELETED)) = topics::split(&topic) {
                bound.push(topics::restored(entity_type));
            }
        }
        bound
    }
}

/// Outcome of running one event through its handlers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Invoke handlers in order, isolating errors and panics
pub async fn dispatch(
    topic: &str,
    handlers: &[Arc<dyn DeletionHandler>],
    event: &DeletionEvent,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    for (index, handler) in handlers.iter().enumerate() {
        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => report.succeeded += 1,
            Ok(Err(e)) => {
                report.failed += 1;
                error!(topic, handler = index, entity_id = %event.entity_id, error = %e, "Deletion handler failed");
            }
            Err(_) => {
                report.failed += 1;
                error!(topic, handler = index, entity_id = %event.entity_id, "Deletion handler panicked");
            }
        }
    }
    report
}
