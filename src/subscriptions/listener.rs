//! In-process deletion listener
//!
//! One dispatch task per subscribed topic, each holding a live receiver on
//! the in-process bus. Receivers are opened before the tasks are spawned,
//! so anything published after `start` returns is delivered. Tasks run
//! until the shutdown signal flips or the bus goes away.
//!
//! Use this when publisher and subscribers share a process. Use the broker
//! listener for cross-service delivery.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{dispatch, DeletionHandler, SubscriptionRegistry};
use crate::events::{DeletionEvent, InProcessBus};

pub struct InProcessListener {
    registry: Arc<SubscriptionRegistry>,
    bus: Arc<InProcessBus>,
}

impl InProcessListener {
    pub fn new(registry: Arc<SubscriptionRegistry>, bus: Arc<InProcessBus>) -> Self {
        Self { registry, bus }
    }

    /// Subscribe every registered topic and spawn its dispatch loop
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let topics = self.registry.topics();
        if topics.is_empty() {
            info!("No deletion subscriptions registered.");
            return Vec::new();
        }

        let handles: Vec<JoinHandle<()>> = topics
            .into_iter()
            .map(|topic| {
                let receiver = self.bus.subscribe(&topic);
                let handlers = self.registry.handlers_on(&topic);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    topic_loop(topic, receiver, handlers, shutdown).await;
                })
            })
            .collect();

        info!("In-process deletion listener started with {} topic loop(s)", handles.len());
        handles
    }
}

/// Dispatch loop for a single topic
async fn topic_loop(
    topic: String,
    mut receiver: broadcast::Receiver<DeletionEvent>,
    handlers: Vec<Arc<dyn DeletionHandler>>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%topic, handlers = handlers.len(), "Topic loop running");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(%topic, "Topic loop shutting down");
                    return;
                }
            }
            received = receiver.recv() => match received {
                Ok(event) => {
                    let report = dispatch(&topic, &handlers, &event).await;
                    debug!(
                        %topic,
                        entity_id = %event.entity_id,
                        succeeded = report.succeeded,
                        failed = report.failed,
                        "Deletion event handled"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%topic, skipped, "Topic loop lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(%topic, "Bus closed, topic loop exiting");
                    return;
                }
            }
        }
    }
}
