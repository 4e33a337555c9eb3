//! Navigation policy registry
//!
//! Maps a parent entity type to the navigations the cascade follows.
//! Typed selectors and predicates are resolved into closures once, at
//! registration; traversal never inspects types by name beyond the map key.
//!
//! The registry is built with [`PolicyRegistryBuilder`] at startup and
//! sealed by `build()`: the resulting [`PolicyRegistry`] has no mutating
//! methods, so it can be shared across cascade calls without locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::entity::{Entity, Record};
use crate::types::Result;

type LookupFn = Arc<dyn Fn(&Record) -> Result<ChildLookup> + Send + Sync>;
type PredicateFn = Arc<dyn Fn(&Record) -> Result<bool> + Send + Sync>;

/// How to fetch the children of one parent through a navigation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildLookup {
    /// All child rows whose `field` equals the parent id
    ByForeignKey { field: String, parent_id: Uuid },
    /// The single referenced row, if the parent points at one
    ById(Option<Uuid>),
}

/// A registered navigation from a parent type to a child type
#[derive(Clone)]
pub struct NavigationPolicy {
    parent_type: String,
    navigation_name: String,
    child_type: String,
    is_collection: bool,
    lookup: LookupFn,
    predicate: Option<PredicateFn>,
}

impl NavigationPolicy {
    pub fn parent_type(&self) -> &str {
        &self.parent_type
    }

    pub fn navigation_name(&self) -> &str {
        &self.navigation_name
    }

    pub fn child_type(&self) -> &str {
        &self.child_type
    }

    pub fn is_collection(&self) -> bool {
        self.is_collection
    }

    /// Resolve the child query for a concrete parent
    pub fn lookup(&self, parent: &Record) -> Result<ChildLookup> {
        (self.lookup)(parent)
    }

    /// Whether a fetched child qualifies for the cascade
    pub fn admits(&self, child: &Record) -> Result<bool> {
        if child.entity_type() != self.child_type {
            return Ok(false);
        }
        match &self.predicate {
            Some(predicate) => predicate(child),
            None => Ok(true),
        }
    }
}

impl fmt::Debug for NavigationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NavigationPolicy")
            .field("parent_type", &self.parent_type)
            .field("navigation_name", &self.navigation_name)
            .field("child_type", &self.child_type)
            .field("is_collection", &self.is_collection)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Startup-time registration surface
#[derive(Default)]
pub struct PolicyRegistryBuilder {
    policies: HashMap<String, Vec<NavigationPolicy>>,
}

impl PolicyRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-to-many: every `C` whose `foreign_key` holds the parent id
    pub fn register_collection<P: Entity, C: Entity>(self, foreign_key: &str) -> Self {
        self.push_collection(P::ENTITY_TYPE, C::ENTITY_TYPE, foreign_key, None)
    }

    /// One-to-many restricted to children matching `predicate`
    pub fn register_collection_where<P, C, F>(self, foreign_key: &str, predicate: F) -> Self
    where
        P: Entity,
        C: Entity,
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.push_collection(
            P::ENTITY_TYPE,
            C::ENTITY_TYPE,
            foreign_key,
            Some(typed_predicate(predicate)),
        )
    }

    /// One-to-many declared by type name, for policies read from configuration
    pub fn register_collection_by_name(
        self,
        parent_type: &str,
        child_type: &str,
        foreign_key: &str,
    ) -> Self {
        self.push_collection(parent_type, child_type, foreign_key, None)
    }

    /// One-to-one: the `C` whose id `selector` reads off the parent
    pub fn register_reference<P, C, S>(self, name: &str, selector: S) -> Self
    where
        P: Entity,
        C: Entity,
        S: Fn(&P) -> Option<Uuid> + Send + Sync + 'static,
    {
        self.push_reference::<P, C, S>(name, selector, None)
    }

    pub fn register_reference_where<P, C, S, F>(self, name: &str, selector: S, predicate: F) -> Self
    where
        P: Entity,
        C: Entity,
        S: Fn(&P) -> Option<Uuid> + Send + Sync + 'static,
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.push_reference::<P, C, S>(name, selector, Some(typed_predicate(predicate)))
    }

    /// Seal the registry
    pub fn build(self) -> Arc<PolicyRegistry> {
        Arc::new(PolicyRegistry {
            policies: self.policies,
        })
    }

    fn push_collection(
        self,
        parent_type: &str,
        child_type: &str,
        foreign_key: &str,
        predicate: Option<PredicateFn>,
    ) -> Self {
        let field = foreign_key.to_string();
        let policy = NavigationPolicy {
            parent_type: parent_type.to_string(),
            navigation_name: format!("{}.{}", child_type, foreign_key),
            child_type: child_type.to_string(),
            is_collection: true,
            lookup: Arc::new(move |parent: &Record| {
                Ok(ChildLookup::ByForeignKey {
                    field: field.clone(),
                    parent_id: parent.id(),
                })
            }),
            predicate,
        };
        self.push(policy)
    }

    fn push_reference<P, C, S>(self, name: &str, selector: S, predicate: Option<PredicateFn>) -> Self
    where
        P: Entity,
        C: Entity,
        S: Fn(&P) -> Option<Uuid> + Send + Sync + 'static,
    {
        let policy = NavigationPolicy {
            parent_type: P::ENTITY_TYPE.to_string(),
            navigation_name: name.to_string(),
            child_type: C::ENTITY_TYPE.to_string(),
            is_collection: false,
            lookup: Arc::new(move |parent: &Record| {
                let parent: P = parent.decode()?;
                Ok(ChildLookup::ById(selector(&parent)))
            }),
            predicate,
        };
        self.push(policy)
    }

    fn push(mut self, policy: NavigationPolicy) -> Self {
        self.policies
            .entry(policy.parent_type.clone())
            .or_default()
            .push(policy);
        self
    }
}

fn typed_predicate<C, F>(predicate: F) -> PredicateFn
where
    C: Entity,
    F: Fn(&C) -> bool + Send + Sync + 'static,
{
    Arc::new(move |child: &Record| {
        let child: C = child.decode()?;
        Ok(predicate(&child))
    })
}

/// Sealed, read-only policy table
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Vec<NavigationPolicy>>,
}

impl PolicyRegistry {
    pub fn builder() -> PolicyRegistryBuilder {
        PolicyRegistryBuilder::new()
    }

    /// Policies for a parent type in registration order; empty means leaf
    pub fn policies_for(&self, parent_type: &str) -> &[NavigationPolicy] {
        self.policies
            .get(parent_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
