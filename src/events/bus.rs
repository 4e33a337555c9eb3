//! In-process topic bus
//!
//! One broadcast channel per subscribed topic pattern. Publishing fans out
//! to every channel whose pattern matches the topic; nothing is persisted,
//! so a receiver created after a publish never sees that event.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::{topics, DeletionEvent, DeletionPublisher};
use crate::types::Result;

const DEFAULT_CAPACITY: usize = 1024;

pub struct InProcessBus {
    channels: DashMap<String, broadcast::Sender<DeletionEvent>>,
    capacity: usize,
}

impl InProcessBus {
    /// `capacity` bounds how far a slow receiver may lag before dropping events
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open a live stream on a topic or `*` pattern
    pub fn subscribe(&self, pattern: &str) -> broadcast::Receiver<DeletionEvent> {
        self.channels
            .entry(pattern.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Live receivers on an exact pattern
    pub fn receiver_count(&self, pattern: &str) -> usize {
        self.channels
            .get(pattern)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl DeletionPublisher for InProcessBus {
    async fn publish_to(&self, topic: &str, event: DeletionEvent) -> Result<()> {
        let mut delivered = 0;
        for channel in self.channels.iter() {
            if topics::matches(channel.key(), topic) {
                // Err only means nobody is listening right now
                if let Ok(receivers) = channel.value().send(event.clone()) {
                    delivered += receivers;
                }
            }
        }

        debug!(
            topic,
            entity_id = %event.entity_id,
            delivered,
            "Deletion event published in-process"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fan_out_to_exact_and_wildcard() {
        let bus = InProcessBus::default();
        let mut exact = bus.subscribe("Display.Deleted");
        let mut any = bus.subscribe("*.Deleted");
        let mut other = bus.subscribe("Batch.Deleted");

        bus.publish(DeletionEvent::new("Display", Uuid::new_v4(), "Batch"))
            .await
            .unwrap();

        assert_eq!(exact.recv().await.unwrap().entity_type, "Display");
        assert_eq!(any.recv().await.unwrap().entity_type, "Display");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_event() {
        let bus = InProcessBus::default();
        bus.publish(DeletionEvent::new("Display", Uuid::new_v4(), "Batch"))
            .await
            .unwrap();

        let mut late = bus.subscribe("Display.Deleted");
        assert!(late.try_recv().is_err());
        assert_eq!(bus.receiver_count("Display.Deleted"), 1);
    }
}
