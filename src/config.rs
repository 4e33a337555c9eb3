//! Configuration for the softcascade service
//!
//! CLI arguments and environment variable handling using clap. Library
//! components take the plain config structs built here and never read the
//! environment themselves.

use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::broker::{BrokerConfig, HandlerFailurePolicy};
use crate::capture::CaptureConfig;
use crate::engine::RetryConfig;

/// How deletion events travel between publisher and subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// In-process bus and an empty in-memory store.
    ///
    /// Smoke-test mode: no entities are seeded and nothing outside the
    /// process can publish, so it only checks that the listeners start
    /// and shut down cleanly.
    Memory,
    /// NATS JetStream and MongoDB
    Nats,
}

/// A one-to-many cascade declared on the command line: `Parent>Child:foreign_key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionPolicySpec {
    pub parent_type: String,
    pub child_type: String,
    pub foreign_key: String,
}

impl std::str::FromStr for CollectionPolicySpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (parent, rest) = s
            .split_once('>')
            .ok_or_else(|| format!("expected Parent>Child:foreign_key, got '{}'", s))?;
        let (child, foreign_key) = rest
            .split_once(':')
            .ok_or_else(|| format!("missing ':foreign_key' in '{}'", s))?;

        let spec = Self {
            parent_type: parent.trim().to_string(),
            child_type: child.trim().to_string(),
            foreign_key: foreign_key.trim().to_string(),
        };
        if spec.parent_type.is_empty() || spec.child_type.is_empty() || spec.foreign_key.is_empty() {
            return Err(format!("empty component in '{}'", s));
        }
        Ok(spec)
    }
}

/// A foreign-key cascade subscription: `TopicOrAlias=LocalType:foreign_key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeSubscriptionSpec {
    pub topic: String,
    pub local_type: String,
    pub foreign_key: String,
}

impl std::str::FromStr for CascadeSubscriptionSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (topic, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected TopicOrAlias=LocalType:foreign_key, got '{}'", s))?;
        let (local_type, foreign_key) = rest
            .split_once(':')
            .ok_or_else(|| format!("missing ':foreign_key' in '{}'", s))?;

        let spec = Self {
            topic: topic.trim().to_string(),
            local_type: local_type.trim().to_string(),
            foreign_key: foreign_key.trim().to_string(),
        };
        if spec.topic.is_empty() || spec.local_type.is_empty() || spec.foreign_key.is_empty() {
            return Err(format!("empty component in '{}'", s));
        }
        Ok(spec)
    }
}

/// softcascade - cascading soft delete with cross-service deletion events
#[derive(Parser, Debug, Clone)]
#[command(name = "softcascade")]
#[command(about = "Deletion-event listener applying cascading soft deletes")]
pub struct Args {
    /// Service name: origin of published events and durable queue name
    #[arg(long, env = "SERVICE_NAME", default_value = "softcascade")]
    pub service_name: String,

    /// Event transport
    #[arg(long, env = "TRANSPORT", value_enum, default_value = "nats")]
    pub transport: Transport,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "softcascade")]
    pub mongodb_db: String,

    /// Exchange (JetStream stream) name
    #[arg(long, env = "EXCHANGE", default_value = crate::broker::DEFAULT_EXCHANGE)]
    pub exchange: String,

    /// Durable queue name (defaults to the service name)
    #[arg(long, env = "QUEUE_NAME")]
    pub queue_name: Option<String>,

    /// Unacknowledged messages in flight per consumer
    #[arg(long, env = "PREFETCH", default_value = "1")]
    pub prefetch: usize,

    /// Publish attempts before giving up
    #[arg(long, env = "PUBLISH_ATTEMPTS", default_value = "3")]
    pub publish_attempts: u32,

    /// Base publish backoff in milliseconds
    #[arg(long, env = "PUBLISH_BACKOFF_MS", default_value = "1000")]
    pub publish_backoff_ms: u64,

    /// Broker connection attempts at startup
    #[arg(long, env = "CONNECT_ATTEMPTS", default_value = "30")]
    pub connect_attempts: u32,

    /// Delay between broker connection attempts in milliseconds
    #[arg(long, env = "CONNECT_DELAY_MS", default_value = "1000")]
    pub connect_delay_ms: u64,

    /// Replays of a cascade after transient failures
    #[arg(long, env = "CASCADE_RETRIES", default_value = "3")]
    pub cascade_retries: u32,

    /// Base replay delay in milliseconds
    #[arg(long, env = "CASCADE_RETRY_DELAY_MS", default_value = "100")]
    pub cascade_retry_delay_ms: u64,

    /// What to do with a message whose handlers failed
    #[arg(long, env = "HANDLER_FAILURE_POLICY", value_enum, default_value = "ack")]
    pub handler_failure_policy: HandlerFailurePolicy,

    /// Announce restores on `{Type}.Restored` and apply incoming ones
    #[arg(long, env = "PROPAGATE_RESTORES", default_value = "false")]
    pub propagate_restores: bool,

    /// Local cascade policy, repeatable: Parent>Child:foreign_key
    #[arg(long = "collection-policy", env = "COLLECTION_POLICIES", value_delimiter = ',')]
    pub collection_policies: Vec<CollectionPolicySpec>,

    /// Foreign-key cascade subscription, repeatable: TopicOrAlias=LocalType:foreign_key
    #[arg(long = "cascade-subscription", env = "CASCADE_SUBSCRIPTIONS", value_delimiter = ',')]
    pub cascade_subscriptions: Vec<CascadeSubscriptionSpec>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl Args {
    /// Get effective queue name (falls back to the service name)
    pub fn queue(&self) -> &str {
        self.queue_name.as_deref().unwrap_or(&self.service_name)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.cascade_retries,
            base_delay: Duration::from_millis(self.cascade_retry_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            origin_service: self.service_name.clone(),
            propagate_restores: self.propagate_restores,
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        let defaults = BrokerConfig::default();
        BrokerConfig {
            exchange: self.exchange.clone(),
            queue: self.queue().to_string(),
            prefetch: self.prefetch,
            publish_retry: RetryConfig {
                max_retries: self.publish_attempts.saturating_sub(1),
                base_delay: Duration::from_millis(self.publish_backoff_ms),
                ..defaults.publish_retry
            },
            connect_attempts: self.connect_attempts,
            connect_delay: Duration::from_millis(self.connect_delay_ms),
            failure_policy: self.handler_failure_policy,
            ..defaults
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.trim().is_empty() {
            return Err("SERVICE_NAME must not be empty".to_string());
        }

        if !is_valid_name(&self.exchange) {
            return Err(format!(
                "EXCHANGE '{}' may not contain whitespace, '.', '*' or '>'",
                self.exchange
            ));
        }

        if !is_valid_name(self.queue()) {
            return Err(format!(
                "QUEUE_NAME '{}' may not contain whitespace, '.', '*' or '>'",
                self.queue()
            ));
        }

        if self.prefetch == 0 {
            return Err("PREFETCH must be at least 1".to_string());
        }

        if self.publish_attempts == 0 {
            return Err("PUBLISH_ATTEMPTS must be at least 1".to_string());
        }

        Ok(())
    }
}

/// JetStream stream and consumer names are single subject tokens
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["softcascade"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_validate() {
        let args = parse(&[]);
        assert!(args.validate().is_ok());
        assert_eq!(args.queue(), "softcascade");
        assert_eq!(args.transport, Transport::Nats);

        let broker = args.broker_config();
        assert_eq!(broker.publish_retry.max_retries, 2);
        assert_eq!(broker.publish_retry.base_delay, Duration::from_secs(1));
        assert_eq!(broker.connect_attempts, 30);
    }

    #[test]
    fn test_policy_and_subscription_flags() {
        let args = parse(&[
            "--service-name",
            "Measurement",
            "--collection-policy",
            "Batch>Display:batch_id",
            "--collection-policy",
            "DisplayType>Batch:display_type_id",
            "--cascade-subscription",
            "OnDisplayDelete=CieMeasure:display_id",
        ]);
        assert_eq!(args.collection_policies.len(), 2);
        assert_eq!(args.collection_policies[0].child_type, "Display");
        assert_eq!(args.cascade_subscriptions[0].topic, "OnDisplayDelete");
        assert_eq!(args.cascade_subscriptions[0].foreign_key, "display_id");
        assert_eq!(args.queue(), "Measurement");
        assert_eq!(args.capture_config().origin_service, "Measurement");
    }

    #[test]
    fn test_malformed_specs_are_rejected() {
        assert!("Batch:batch_id".parse::<CollectionPolicySpec>().is_err());
        assert!("Batch>Display".parse::<CollectionPolicySpec>().is_err());
        assert!("Batch>:x".parse::<CollectionPolicySpec>().is_err());
        assert!("OnDisplayDelete".parse::<CascadeSubscriptionSpec>().is_err());
    }

    #[test]
    fn test_memory_transport_selectable() {
        let args = parse(&["--transport", "memory"]);
        assert_eq!(args.transport, Transport::Memory);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_invalid_names_fail_validation() {
        let args = parse(&["--exchange", "soft.delete"]);
        assert!(args.validate().is_err());
        let args = parse(&["--prefetch", "0"]);
        assert!(args.validate().is_err());
    }
}
