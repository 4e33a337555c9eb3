//! Cross-service delivery over NATS JetStream
//!
//! The exchange is a file-backed stream named after the exchange, holding
//! subjects `{exchange}.{EntityType}.Deleted` and
//! `{exchange}.{EntityType}.Restored`; the routing key is the subject with
//! the exchange prefix removed. Each consuming service owns a durable pull
//! consumer (its queue) filtered to the topics it subscribed.

pub mod client;
pub mod listener;
pub mod publisher;

use std::time::Duration;

use async_nats::jetstream::{self, stream::Stream};
use tracing::info;

use crate::engine::RetryConfig;
use crate::events::topics;
use crate::types::{CascadeError, Result};

pub use client::NatsClient;
pub use listener::{BrokerListener, HandlerFailurePolicy};
pub use publisher::BrokerPublisher;

pub const DEFAULT_EXCHANGE: &str = "SoftDeleteExchange";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Stream name and subject prefix
    pub exchange: String,
    /// Durable consumer name; one per consuming service
    pub queue: String,
    /// Unacknowledged messages allowed in flight
    pub prefetch: usize,
    /// Publish attempts = `max_retries + 1`
    pub publish_retry: RetryConfig,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    /// How long events stay in the stream
    pub max_age: Duration,
    /// Redelivery timeout for unacknowledged messages
    pub ack_wait: Duration,
    pub failure_policy: HandlerFailurePolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            queue: "softcascade".to_string(),
            prefetch: 1,
            publish_retry: RetryConfig {
                max_retries: 2,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
            },
            connect_attempts: 30,
            connect_delay: Duration::from_secs(1),
            max_age: Duration::from_secs(7 * 24 * 3600), // 7 days
            ack_wait: Duration::from_secs(30),
            failure_policy: HandlerFailurePolicy::default(),
        }
    }
}

/// Subject for a topic on the exchange
pub fn subject_for(exchange: &str, topic: &str) -> String {
    format!("{}.{}", exchange, topic)
}

/// Routing key (topic) of a subject on the exchange
pub fn topic_from_subject<'a>(exchange: &str, subject: &'a str) -> Option<&'a str> {
    subject
        .strip_prefix(exchange)?
        .strip_prefix('.')
        .filter(|topic| !topic.is_empty())
}

/// Consumer filter subjects for subscribed topics.
///
/// JetStream rejects overlapping filters, so topics already covered by a
/// subscribed wildcard pattern are dropped.
pub fn consumer_filters(exchange: &str, subscribed: &[String]) -> Vec<String> {
    let mut filters = Vec::new();
    for topic in subscribed {
        let covered = subscribed
            .iter()
            .any(|other| other != topic && topics::matches(other, topic));
        if !covered && !filters.contains(&subject_for(exchange, topic)) {
            filters.push(subject_for(exchange, topic));
        }
    }
    filters
}

/// Create the exchange stream if it does not exist yet
pub(crate) async fn ensure_stream(
    jetstream: &jetstream::Context,
    config: &BrokerConfig,
) -> Result<Stream> {
    let stream = jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: config.exchange.clone(),
            subjects: vec![
                subject_for(&config.exchange, &topics::deleted(topics::WILDCARD)),
                subject_for(&config.exchange, &topics::restored(topics::WILDCARD)),
            ],
            max_age: config.max_age,
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        })
        .await
        .map_err(|e| CascadeError::Broker(format!("Failed to create stream: {}", e)))?;

    info!("Using stream {} for deletion events", config.exchange);
    Ok(stream)
}
