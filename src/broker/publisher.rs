//! JetStream deletion publisher
//!
//! Publishes each event to `{exchange}.{topic}` and waits for the stream's
//! acknowledgement. A failed attempt is retried with increasing backoff up
//! to the configured bound, then surfaced as `CascadeError::Publish`.

use async_nats::jetstream;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ensure_stream, subject_for, BrokerConfig, NatsClient};
use crate::events::{DeletionEvent, DeletionPublisher};
use crate::types::{CascadeError, Result};

pub struct BrokerPublisher {
    jetstream: jetstream::Context,
    config: BrokerConfig,
}

impl BrokerPublisher {
    /// Create a publisher, declaring the exchange stream if needed
    pub async fn new(client: &NatsClient, config: BrokerConfig) -> Result<Self> {
        let publisher = Self {
            jetstream: client.jetstream().clone(),
            config,
        };
        ensure_stream(&publisher.jetstream, &publisher.config).await?;
        info!("Deletion publisher ready on exchange {}", publisher.config.exchange);
        Ok(publisher)
    }

    async fn publish_once(&self, subject: &str, payload: bytes::Bytes) -> Result<()> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| CascadeError::Broker(format!("Publish failed: {}", e)))?;
        ack.await
            .map_err(|e| CascadeError::Broker(format!("Publish not acknowledged: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl DeletionPublisher for BrokerPublisher {
    async fn publish_to(&self, topic: &str, event: DeletionEvent) -> Result<()> {
        let subject = subject_for(&self.config.exchange, topic);
        let payload = event.to_bytes()?;
        let attempts = self.config.publish_retry.max_retries + 1;

        let mut attempt = 1;
        loop {
            match self.publish_once(&subject, payload.clone()).await {
                Ok(()) => {
                    debug!(
                        %subject,
                        entity_id = %event.entity_id,
                        correlation_id = %event.correlation_id,
                        "Deletion event published"
                    );
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    let delay = self.config.publish_retry.delay_for(attempt);
                    warn!(
                        "Publish to {} failed (attempt {}/{}): {}; retrying in {:?}",
                        subject, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(CascadeError::Publish {
                        attempts,
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}
