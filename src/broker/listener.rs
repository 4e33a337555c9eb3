//! Deletion listener - NATS JetStream consumer for deletion events
//!
//! Binds the service's durable consumer to its subscribed topics, runs the
//! registered handlers for each message, and only then settles it.
//! Messages that cannot be decoded are terminated (never redelivered) so a
//! poison message cannot block the queue.
//!
//! Shutdown is observed between messages: a message whose handlers already
//! started runs to completion and is settled before the loop exits.

use async_nats::jetstream::{self, consumer::PullConsumer, stream::Stream, AckKind};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{consumer_filters, ensure_stream, topic_from_subject, BrokerConfig, NatsClient};
use crate::events::DeletionEvent;
use crate::subscriptions::{dispatch, DispatchReport, SubscriptionRegistry};
use crate::types::{CascadeError, Result};

/// What to do with a message whose handlers reported failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum HandlerFailurePolicy {
    /// Acknowledge anyway; failures were logged
    #[default]
    Ack,
    /// Terminate the message so it is not redelivered
    Terminate,
}

/// How a message was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Subject or payload could not be decoded
    Malformed,
    /// No local handler for the topic
    Unhandled,
    Dispatched(DispatchReport),
}

/// Final disposition of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Terminate,
}

pub fn settle(delivery: Delivery, policy: HandlerFailurePolicy) -> Settlement {
    match delivery {
        Delivery::Malformed => Settlement::Terminate,
        Delivery::Unhandled => Settlement::Ack,
        Delivery::Dispatched(report)
            if report.failed > 0 && policy == HandlerFailurePolicy::Terminate =>
        {
            Settlement::Terminate
        }
        Delivery::Dispatched(_) => Settlement::Ack,
    }
}

/// Background consumer dispatching broker events to local handlers
pub struct BrokerListener {
    jetstream: jetstream::Context,
    registry: Arc<SubscriptionRegistry>,
    config: BrokerConfig,
}

impl BrokerListener {
    pub fn new(client: &NatsClient, registry: Arc<SubscriptionRegistry>, config: BrokerConfig) -> Self {
        Self {
            jetstream: client.jetstream().clone(),
            registry,
            config,
        }
    }

    /// Consume until the shutdown signal flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.registry.is_empty() {
            info!("No deletion subscriptions registered.");
            return Ok(());
        }

        let stream = ensure_stream(&self.jetstream, &self.config).await?;
        let consumer = self.ensure_consumer(&stream).await?;

        info!("Deletion listener {} starting message loop", self.config.queue);

        while !shutdown_requested(&shutdown) {
            match self.process_batch(&consumer, &mut shutdown).await {
                Ok(count) => {
                    if count > 0 {
                        debug!("Processed {} deletion events", count);
                    }
                }
                Err(e) => {
                    error!("Error processing batch: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Deletion listener {} stopped", self.config.queue);
        Ok(())
    }

    /// Ensure the durable consumer exists, filtered to the subscribed topics
    async fn ensure_consumer(&self, stream: &Stream) -> Result<PullConsumer> {
        let filters = consumer_filters(&self.config.exchange, &self.registry.topics());

        let consumer = stream
            .get_or_create_consumer(
                &self.config.queue,
                jetstream::consumer::pull::Config {
                    durable_name: Some(self.config.queue.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    filter_subjects: filters.clone(),
                    max_ack_pending: self.config.prefetch.max(1) as i64,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| CascadeError::Broker(format!("Failed to create consumer: {}", e)))?;

        for filter in &filters {
            info!("Consumer {} bound to {}", self.config.queue, filter);
        }
        Ok(consumer)
    }

    /// Process a batch of messages; unprocessed ones are redelivered later
    async fn process_batch(
        &self,
        consumer: &PullConsumer,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<usize> {
        let fetch = consumer
            .fetch()
            .max_messages(self.config.prefetch.max(1))
            .expires(Duration::from_secs(5))
            .messages();

        let mut messages = tokio::select! {
            fetched = fetch => fetched
                .map_err(|e| CascadeError::Broker(format!("Failed to fetch messages: {}", e)))?,
            _ = shutdown.changed() => return Ok(0),
        };

        let count = consume(&mut messages, shutdown, |msg_result| async move {
            match msg_result {
                Ok(msg) => {
                    self.process_message(msg).await;
                    true
                }
                Err(e) => {
                    warn!("Error receiving message: {}", e);
                    false
                }
            }
        })
        .await;

        Ok(count)
    }

    /// Process a single message, settling it after its handlers ran
    async fn process_message(&self, msg: jetstream::Message) {
        let delivery = self.deliver(msg.subject.as_str(), &msg.payload).await;

        let settled = match settle(delivery, self.config.failure_policy) {
            Settlement::Ack => msg.ack().await,
            Settlement::Terminate => msg.ack_with(AckKind::Term).await,
        };
        if let Err(e) = settled {
            warn!("Failed to settle message on {}: {}", msg.subject, e);
        }
    }

    async fn deliver(&self, subject: &str, payload: &[u8]) -> Delivery {
        let Some(topic) = topic_from_subject(&self.config.exchange, subject) else {
            error!("Message on unexpected subject {}", subject);
            return Delivery::Malformed;
        };

        let event = match DeletionEvent::from_bytes(payload) {
            Ok(event) => event,
            Err(e) => {
                error!("Failed to parse deletion event on {}: {}", topic, e);
                return Delivery::Malformed;
            }
        };

        let handlers = self.registry.handlers_for(topic);
        if handlers.is_empty() {
            debug!(%topic, "No handlers for topic, acknowledging");
            return Delivery::Unhandled;
        }

        debug!(
            %topic,
            entity_id = %event.entity_id,
            origin = %event.origin_service,
            "Dispatching deletion event"
        );
        Delivery::Dispatched(dispatch(topic, &handlers, &event).await)
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Feed items to `process` until the stream ends or shutdown is requested.
///
/// Only the wait for the next item races the shutdown signal; an item
/// already handed to `process` is never cancelled. Returns how many items
/// `process` reported as handled.
pub(crate) async fn consume<S, F, Fut>(
    items: &mut S,
    shutdown: &mut watch::Receiver<bool>,
    mut process: F,
) -> usize
where
    S: futures_util::Stream + Unpin,
    F: FnMut(S::Item) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut handled = 0;
    loop {
        if shutdown_requested(shutdown) {
            break;
        }
        let next = tokio::select! {
            next = items.next() => next,
            _ = shutdown.changed() => break,
        };
        let Some(item) = next else {
            break;
        };
        if process(item).await {
            handled += 1;
        }
    }
    handled
}
