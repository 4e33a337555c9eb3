//! NATS client wrapper
//!
//! Connection management with a bounded initial-connect retry, so a
//! service started alongside its broker waits for it instead of failing.

use async_nats::{jetstream, ConnectOptions};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::NatsArgs;
use crate::types::{CascadeError, Result};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// NATS client wrapper with JetStream support
#[derive(Clone)]
pub struct NatsClient {
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect once, failing fast if NATS isn't available
    pub async fn new(args: &NatsArgs, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        // Reconnection still works after an initial successful connection
        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| CascadeError::Broker(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        Ok(Self {
            jetstream: jetstream::new(client),
        })
    }

    /// Connect, retrying up to `attempts` times `delay` apart
    pub async fn connect_with_retry(
        args: &NatsArgs,
        name: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::new(args, name).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt < attempts => {
                    warn!(
                        "NATS not ready (attempt {}/{}): {}; retrying in {:?}",
                        attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(CascadeError::Broker(format!(
                        "Could not connect after {} attempts: {}",
                        attempts, e
                    )))
                }
            }
        }
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }
}
