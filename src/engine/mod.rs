//! Cascade engine
//!
//! Soft-deletes or restores a root entity and everything reachable from it
//! through the registered navigation policies, in one transaction.
//!
//! Traversal is an explicit depth-first worklist with a visited set keyed
//! by entity id, so cyclic and diamond-shaped graphs terminate and every
//! entity is flipped at most once. The transaction is wrapped in an
//! [`ExecutionStrategy`]: a transient failure replays the whole unit of
//! work, never a partial one.

pub mod strategy;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entity::{Entity, Record, Transition};
use crate::policy::{ChildLookup, NavigationPolicy, PolicyRegistry};
use crate::store::{SaveInterceptor, Store, UnitOfWork, Visibility};
use crate::types::{CascadeError, Result};

pub use strategy::{ExecutionStrategy, RetryConfig};

/// Where a cascade starts
#[derive(Debug, Clone)]
pub enum Root {
    /// Load the root by id, bypassing the deleted filter
    ById { entity_type: String, id: Uuid },
    /// An already-loaded root; its current stored state is re-read inside the transaction
    Loaded(Record),
}

impl Root {
    pub fn by_id<T: Entity>(id: Uuid) -> Self {
        Self::ById {
            entity_type: T::ENTITY_TYPE.to_string(),
            id,
        }
    }

    pub fn by_type(entity_type: impl Into<String>, id: Uuid) -> Self {
        Self::ById {
            entity_type: entity_type.into(),
            id,
        }
    }

    pub fn entity<T: Entity>(entity: &T) -> Result<Self> {
        Ok(Self::Loaded(Record::from_entity(entity)?))
    }

    pub fn record(record: Record) -> Self {
        Self::Loaded(record)
    }

    fn key(&self) -> (&str, Uuid) {
        match self {
            Self::ById { entity_type, id } => (entity_type, *id),
            Self::Loaded(record) => (record.entity_type(), record.id()),
        }
    }
}

/// Whether policies are followed past the root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeScope {
    Cascade,
    RootOnly,
}

/// An entity whose delete flag this cascade changed
#[derive(Debug, Clone)]
pub struct TouchedEntity {
    pub entity: Record,
    pub actor: Option<String>,
}

impl TouchedEntity {
    pub fn entity_type(&self) -> &str {
        self.entity.entity_type()
    }

    pub fn id(&self) -> Uuid {
        self.entity.id()
    }

    pub fn decode<T: Entity>(&self) -> Result<T> {
        self.entity.decode()
    }
}

pub struct CascadeEngine {
    store: Arc<dyn Store>,
    policies: Arc<PolicyRegistry>,
    interceptors: Vec<Arc<dyn SaveInterceptor>>,
    strategy: ExecutionStrategy,
}

impl CascadeEngine {
    pub fn new(store: Arc<dyn Store>, policies: Arc<PolicyRegistry>) -> Self {
        Self {
            store,
            policies,
            interceptors: Vec::new(),
            strategy: ExecutionStrategy::default(),
        }
    }

    /// Register a save hook (change capture, auditing)
    pub fn with_interceptor(mut self, interceptor: Arc<dyn SaveInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    /// Soft-delete `root` and everything reachable from it
    pub async fn soft_delete(&self, root: Root, actor: Option<&str>) -> Result<Vec<TouchedEntity>> {
        self.apply(root, actor, Transition::SoftDelete, CascadeScope::Cascade)
            .await
    }

    /// Restore `root` and everything reachable from it
    pub async fn restore(&self, root: Root, actor: Option<&str>) -> Result<Vec<TouchedEntity>> {
        self.apply(root, actor, Transition::Restore, CascadeScope::Cascade)
            .await
    }

    /// Soft-delete the root alone, ignoring policies
    pub async fn soft_delete_one(
        &self,
        root: Root,
        actor: Option<&str>,
    ) -> Result<Vec<TouchedEntity>> {
        self.apply(root, actor, Transition::SoftDelete, CascadeScope::RootOnly)
            .await
    }

    pub async fn restore_one(&self, root: Root, actor: Option<&str>) -> Result<Vec<TouchedEntity>> {
        self.apply(root, actor, Transition::Restore, CascadeScope::RootOnly)
            .await
    }

    /// Run one cascade as a single transactional unit of work.
    ///
    /// Returns the entities whose flag changed, root first, in traversal
    /// order. An unknown root fails with `NotFound` before any transaction
    /// opens.
    pub async fn apply(
        &self,
        root: Root,
        actor: Option<&str>,
        transition: Transition,
        scope: CascadeScope,
    ) -> Result<Vec<TouchedEntity>> {
        let (entity_type, id) = root.key();
        let (entity_type, id) = (entity_type.to_string(), id);

        let exists = self
            .strategy
            .execute(|_| self.store.find(&entity_type, id, Visibility::All))
            .await?
            .is_some();
        if !exists {
            return Err(CascadeError::not_found(entity_type, id));
        }

        let touched = self
            .strategy
            .execute(|attempt| {
                let entity_type = entity_type.clone();
                async move {
                    if attempt > 1 {
                        debug!(attempt, %entity_type, %id, "Replaying cascade");
                    }
                    self.attempt(&entity_type, id, actor, transition, scope)
                        .await
                }
            })
            .await?;

        info!(
            transition = transition.as_str(),
            %entity_type,
            %id,
            touched = touched.len(),
            "Cascade complete"
        );
        Ok(touched)
    }

    async fn attempt(
        &self,
        entity_type: &str,
        id: Uuid,
        actor: Option<&str>,
        transition: Transition,
        scope: CascadeScope,
    ) -> Result<Vec<TouchedEntity>> {
        let mut uow = UnitOfWork::begin(self.store.as_ref(), self.interceptors.clone()).await?;

        let outcome = match self
            .traverse(&mut uow, entity_type, id, actor, transition, scope)
            .await
        {
            Ok(touched) => uow.save_changes().await.map(|_| touched),
            Err(e) => Err(e),
        };

        let touched = match outcome {
            Ok(touched) => touched,
            Err(e) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                return Err(e);
            }
        };

        uow.commit().await?;
        Ok(touched)
    }

    async fn traverse(
        &self,
        uow: &mut UnitOfWork,
        entity_type: &str,
        id: Uuid,
        actor: Option<&str>,
        transition: Transition,
        scope: CascadeScope,
    ) -> Result<Vec<TouchedEntity>> {
        let root = uow
            .find(entity_type, id, Visibility::All)
            .await?
            .ok_or_else(|| CascadeError::not_found(entity_type, id))?;

        let now = Utc::now();
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut stack = vec![root];
        let mut touched = Vec::new();

        while let Some(mut node) = stack.pop() {
            if !visited.insert(node.id()) {
                continue;
            }

            let original = node.is_deleted();
            if node.apply(transition, actor, now) {
                uow.track_modified(original, node.clone());
                touched.push(TouchedEntity {
                    entity: node.clone(),
                    actor: actor.map(str::to_string),
                });
            }

            if scope == CascadeScope::RootOnly {
                break;
            }

            let mut children = Vec::new();
            for policy in self.policies.policies_for(node.entity_type()) {
                children.extend(self.children_of(uow, policy, &node).await?);
            }

            // Reverse so the first registered child is visited first
            for child in children.into_iter().rev() {
                if !visited.contains(&child.id()) {
                    stack.push(child);
                }
            }
        }

        Ok(touched)
    }

    async fn children_of(
        &self,
        uow: &mut UnitOfWork,
        policy: &NavigationPolicy,
        parent: &Record,
    ) -> Result<Vec<Record>> {
        let lookup = policy
            .lookup(parent)
            .map_err(|e| navigation_error(policy, e))?;

        let fetched = match lookup {
            ChildLookup::ByForeignKey { field, parent_id } => {
                uow.find_by_field(policy.child_type(), &field, parent_id, Visibility::All)
                    .await
            }
            ChildLookup::ById(Some(child_id)) => uow
                .find(policy.child_type(), child_id, Visibility::All)
                .await
                .map(|found| found.into_iter().collect()),
            ChildLookup::ById(None) => Ok(Vec::new()),
        };

        let fetched = fetched.map_err(|e| {
            if e.is_transient() {
                e
            } else {
                navigation_error(policy, e)
            }
        })?;

        let mut admitted = Vec::with_capacity(fetched.len());
        for child in fetched {
            if policy
                .admits(&child)
                .map_err(|e| navigation_error(policy, e))?
            {
                admitted.push(child);
            }
        }
        Ok(admitted)
    }
}

fn navigation_error(policy: &NavigationPolicy, cause: CascadeError) -> CascadeError {
    CascadeError::Navigation {
        parent_type: policy.parent_type().to_string(),
        navigation: policy.navigation_name().to_string(),
        message: cause.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityMeta;
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, Debug)]
    struct Node {
        #[serde(flatten)]
        meta: EntityMeta,
        parent_id: Option<Uuid>,
        next_id: Option<Uuid>,
    }

    impl Entity for Node {
        const ENTITY_TYPE: &'static str = "Node";
        fn meta(&self) -> &EntityMeta {
            &self.meta
        }
        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    fn node(parent_id: Option<Uuid>) -> Node {
        Node {
            meta: EntityMeta::new(),
            parent_id,
            next_id: None,
        }
    }

    fn engine(store: &MemoryStore, policies: Arc<PolicyRegistry>) -> CascadeEngine {
        CascadeEngine::new(Arc::new(store.clone()), policies)
    }

    #[tokio::test]
    async fn test_pre_order_with_registration_order() {
        let store = MemoryStore::new();
        let root = node(None);
        let a = node(Some(root.id()));
        let a1 = node(Some(a.id()));
        let b = node(Some(root.id()));
        for n in [&root, &a, &a1, &b] {
            store.insert_entity(n).await.unwrap();
        }

        let policies = PolicyRegistry::builder()
            .register_collection::<Node, Node>("parent_id")
            .build();
        let touched = engine(&store, policies)
            .soft_delete(Root::by_id::<Node>(root.id()), Some("ops"))
            .await
            .unwrap();

        let order: Vec<Uuid> = touched.iter().map(TouchedEntity::id).collect();
        assert_eq!(order, vec![root.id(), a.id(), a1.id(), b.id()]);
        assert!(touched.iter().all(|t| t.actor.as_deref() == Some("ops")));
    }

    #[tokio::test]
    async fn test_reference_cycle_terminates() {
        let store = MemoryStore::new();
        let mut x = node(None);
        let mut y = node(None);
        x.next_id = Some(y.id());
        y.next_id = Some(x.id());
        store.insert_entity(&x).await.unwrap();
        store.insert_entity(&y).await.unwrap();

        let policies = PolicyRegistry::builder()
            .register_reference::<Node, Node, _>("next", |n| n.next_id)
            .build();
        let touched = engine(&store, policies)
            .soft_delete(Root::entity(&x).unwrap(), None)
            .await
            .unwrap();

        assert_eq!(touched.len(), 2);
        let stored: Node = store.get(y.id()).await.unwrap().unwrap();
        assert!(stored.meta.is_deleted);
        assert!(stored.meta.deleted_by.is_none());
    }

    #[tokio::test]
    async fn test_root_only_ignores_policies() {
        let store = MemoryStore::new();
        let root = node(None);
        let child = node(Some(root.id()));
        store.insert_entity(&root).await.unwrap();
        store.insert_entity(&child).await.unwrap();

        let policies = PolicyRegistry::builder()
            .register_collection::<Node, Node>("parent_id")
            .build();
        let engine = engine(&store, policies);
        let touched = engine
            .soft_delete_one(Root::by_id::<Node>(root.id()), None)
            .await
            .unwrap();
        assert_eq!(touched.len(), 1);
        let stored: Node = store.get(child.id()).await.unwrap().unwrap();
        assert!(!stored.meta.is_deleted);

        let restored = engine
            .restore_one(Root::by_id::<Node>(root.id()), None)
            .await
            .unwrap();
        assert_eq!(restored.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_root_is_not_found() {
        let store = MemoryStore::new();
        let err = engine(&store, PolicyRegistry::builder().build())
            .soft_delete(Root::by_type("Node", Uuid::new_v4()), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.transactions_started(), 0);
    }
}
