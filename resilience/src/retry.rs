//! Retry logic with exponential backoff and jitter.
//!
//! Used by LLM provider clients to bound transient-failure retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between attempts (ms).
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts (ms).
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 = none, 1.0 = full).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Executes operations under a retry policy.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, `should_retry` rejects the error,
    /// or attempts are exhausted. The last error is returned as-is.
    pub async fn execute<T, E, F, Fut, P>(&self, operation: F, should_retry: P) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= self.config.max_attempts || !should_retry(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Attempt {}/{} failed: {}; retrying in {}ms",
                        attempt,
                        self.config.max_attempts,
                        err,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.max_delay_ms as f64);
        let jitter = if self.config.jitter_factor > 0.0 {
            let spread = capped * self.config.jitter_factor;
            rand::thread_rng().gen_range(0.0..=spread)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter) as u64)
    }
}
