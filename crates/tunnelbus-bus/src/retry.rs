//! Bounded retry with a fixed delay, used for the initial broker connection

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: usize,
    /// Pause between two attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Max attempts reached")]
    MaxAttemptsReached,
}

/// Tracks attempts against a [`RetryPolicy`]
pub struct RetryManager {
    policy: RetryPolicy,
    attempt: usize,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Record a failed attempt and wait before the next one
    ///
    /// Fails without sleeping once the failed attempt was the last allowed.
    pub async fn wait(&mut self) -> Result<(), RetryError> {
        self.attempt += 1;

        if self.attempt >= self.policy.max_attempts {
            return Err(RetryError::MaxAttemptsReached);
        }

        debug!(
            "Waiting {}ms before attempt {}",
            self.policy.delay.as_millis(),
            self.attempt + 1
        );

        sleep(self.policy.delay).await;
        Ok(())
    }

    /// Number of failed attempts so far
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
