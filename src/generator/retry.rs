//! Retry loop around one generation request.

use std::future::Future;
use std::time::Duration;

use super::{ApiKeyManager, GenerationError};

/// How a failed attempt is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The key is exhausted. Wait for any key, then retry.
    RateLimited,
    /// Wait, then retry.
    Retry,
    /// Give up immediately.
    Fatal,
}

impl GenerationError {
    /// Classify the error for [`RetryPolicy`].
    pub fn outcome(&self) -> Outcome {
        match self {
            GenerationError::RateLimited { .. } => Outcome::RateLimited,
            GenerationError::Generation(_) => Outcome::Retry,
            GenerationError::Unauthorized | GenerationError::Malformed(_) => {
                Outcome::Fatal
            },
        }
    }
}

/// Bounded retries with a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a new [`RetryPolicy`]. At least one attempt is always made.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Maximum number of attempts.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails fatally or runs out of
    /// attempts.
    pub async fn run<T, F, Fut>(&self, keys: &ApiKeyManager, mut operation: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        for attempt in 1..=self.max_attempts {
            let error = match operation().await {
                Ok(value) => return Some(value),
                Err(error) => error,
            };

            match error.outcome() {
                Outcome::Fatal => {
                    tracing::error!(%error, attempt, "generation failed, not retrying");
                    return None;
                },
                Outcome::RateLimited => {
                    if let GenerationError::RateLimited {
                        retry_after: Some(delay),
                    } = error
                    {
                        keys.update_retry_delay(delay);
                    }
                    tracing::debug!(attempt, "rate limited, retrying");
                },
                Outcome::Retry => {
                    tracing::debug!(%error, attempt, "generation error, retrying");
                },
            }

            keys.wait_for_any_key().await;
            tokio::time::sleep(self.delay).await;
        }

        tracing::debug!(attempts = self.max_attempts, "max retry attempts reached");
        None
    }
}
