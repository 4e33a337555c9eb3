//! softcascade - cascading soft delete with cross-service deletion events
//!
//! Soft-deletes (and restores) an entity together with everything reachable
//! from it through registered navigation policies, in one retried
//! transaction, then announces each deletion to other services.
//!
//! ## Components
//!
//! - **Policy**: parent type to child navigation registry
//! - **Engine**: transactional, cycle-safe cascade traversal
//! - **Capture**: stages delete-flag transitions, publishes after commit
//! - **Events**: event shape, topics, and the in-process bus
//! - **Broker**: NATS JetStream publisher and durable listener
//! - **Subscriptions**: topic and alias to handler registry with dispatch loops
//! - **Store**: persistence seam with in-memory and MongoDB implementations

pub mod broker;
pub mod capture;
pub mod config;
pub mod engine;
pub mod entity;
pub mod events;
pub mod policy;
pub mod store;
pub mod subscriptions;
pub mod types;

pub use capture::{CaptureConfig, ChangeCapture};
pub use config::Args;
pub use engine::{CascadeEngine, CascadeScope, Root, TouchedEntity};
pub use entity::{Entity, EntityMeta, Record, Transition};
pub use events::{DeletionEvent, DeletionPublisher, DeletionPublisherExt, InProcessBus};
pub use policy::PolicyRegistry;
pub use subscriptions::{handler_fn, DeletionHandler, SubscriptionRegistry};
pub use types::{CascadeError, Result};
