//! Retrying execution strategy
//!
//! Wraps a whole unit of work: a transient failure anywhere inside it
//! (lookup, save, or commit) replays the operation from the start.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::types::Result;

/// Bounded exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Replays after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// `delay_for` plus up to 25% random jitter
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let spread = delay.as_millis() as u64 / 4;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionStrategy {
    config: RetryConfig,
}

impl ExecutionStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `op` until it succeeds, fails non-transiently, or retries run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt <= self.config.max_retries => {
                    let delay = self.config.jittered_delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, replaying unit of work"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
