//! Shared fixtures: a display-manufacturing domain split over two services
//!
//! The Batch service owns DisplayType > Batch > Display. The Measurement
//! service owns CieMeasure rows that reference displays by id.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use softcascade::capture::{CaptureConfig, ChangeCapture};
use softcascade::engine::{CascadeEngine, ExecutionStrategy, RetryConfig};
use softcascade::entity::{Entity, EntityMeta};
use softcascade::events::DeletionPublisher;
use softcascade::policy::PolicyRegistry;
use softcascade::store::MemoryStore;

macro_rules! entity {
    ($ty:ident) => {
        impl Entity for $ty {
            const ENTITY_TYPE: &'static str = stringify!($ty);
            fn meta(&self) -> &EntityMeta {
                &self.meta
            }
            fn meta_mut(&mut self) -> &mut EntityMeta {
                &mut self.meta
            }
        }
    };
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DisplayType {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Batch {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub display_type_id: Uuid,
    pub lot: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Display {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub batch_id: Uuid,
    pub serial: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CieMeasure {
    #[serde(flatten)]
    pub meta: EntityMeta,
    pub display_id: Uuid,
    pub luminance: f64,
}

entity!(DisplayType);
entity!(Batch);
entity!(Display);
entity!(CieMeasure);

pub fn display_type() -> DisplayType {
    DisplayType {
        meta: EntityMeta::new(),
        name: "OLED-55".into(),
    }
}

pub fn batch(display_type: &DisplayType) -> Batch {
    Batch {
        meta: EntityMeta::new(),
        display_type_id: display_type.id(),
        lot: "L-1".into(),
    }
}

pub fn display(batch: &Batch, serial: &str) -> Display {
    Display {
        meta: EntityMeta::new(),
        batch_id: batch.id(),
        serial: serial.into(),
    }
}

pub fn measure(display_id: Uuid) -> CieMeasure {
    CieMeasure {
        meta: EntityMeta::new(),
        display_id,
        luminance: 420.0,
    }
}

/// Batch service policies: DisplayType > Batches, Batch > Displays
pub fn batch_policies() -> Arc<PolicyRegistry> {
    PolicyRegistry::builder()
        .register_collection::<Batch, Display>("batch_id")
        .register_collection::<DisplayType, Batch>("display_type_id")
        .build()
}

/// A display type with one batch of three displays, already stored
pub struct BatchFixture {
    pub display_type: DisplayType,
    pub batch: Batch,
    pub displays: Vec<Display>,
}

pub async fn seed_batch(store: &MemoryStore) -> BatchFixture {
    let display_type = display_type();
    let batch = batch(&display_type);
    let displays: Vec<Display> = ["D-1", "D-2", "D-3"]
        .iter()
        .map(|serial| display(&batch, serial))
        .collect();

    store.insert_entity(&display_type).await.unwrap();
    store.insert_entity(&batch).await.unwrap();
    for d in &displays {
        store.insert_entity(d).await.unwrap();
    }

    BatchFixture {
        display_type,
        batch,
        displays,
    }
}

/// Replays quickly so retry tests stay fast
pub fn fast_strategy() -> ExecutionStrategy {
    ExecutionStrategy::new(RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    })
}

/// Engine with change capture publishing to `publisher`
pub fn engine_with_capture(
    store: &MemoryStore,
    policies: Arc<PolicyRegistry>,
    service: &str,
    publisher: Arc<dyn DeletionPublisher>,
) -> (Arc<CascadeEngine>, Arc<ChangeCapture>) {
    let capture = Arc::new(ChangeCapture::new(
        CaptureConfig {
            origin_service: service.to_string(),
            propagate_restores: false,
        },
        publisher,
    ));
    let engine = CascadeEngine::new(Arc::new(store.clone()), policies)
        .with_interceptor(capture.clone())
        .with_strategy(fast_strategy());
    (Arc::new(engine), capture)
}

/// Poll `check` until it holds or the deadline passes
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
