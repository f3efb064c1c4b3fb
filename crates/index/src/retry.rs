use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    /// Fail on the first error.
    pub fn none() -> Self {
        Self::new(0, 0, 0)
    }

    /// Run `f` until it succeeds or `max_retries` retries are spent, doubling
    /// the pause after each failure up to `max_backoff`. Only the last error
    /// is returned; results of failed attempts are never merged.
    pub async fn retry<F, Fut, T, E>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            let err = match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempts = attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if attempt > self.max_retries {
                warn!(operation, attempts = attempt, error = %err, "giving up");
                return Err(err);
            }

            warn!(
                operation,
                attempt,
                max_retries = self.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
            attempt += 1;
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.initial_backoff_ms,
            config.max_backoff_ms,
        )
    }
}
