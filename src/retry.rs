//! Retry utilities with exponential backoff
//!
//! Used by the HTTP transport to reopen a call that failed before any response
//! body arrived. Once frames start flowing an exchange is never retried
//! automatically; a failed turn is resubmitted by the caller instead.
//!
//! # Examples
//!
//! ```rust,no_run
//! use chat_exchange::retry::{retry_with_backoff, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::default()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_millis(250));
//!
//! let result = retry_with_backoff(config, || async {
//!     // Your async operation here
//!     Ok::<_, chat_exchange::Error>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::TransportError;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial delay before first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles the delay each time)
    pub backoff_multiplier: f64,

    /// Add random jitter to prevent thundering herd (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt with exponential backoff and jitter
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let exponential_delay = base_delay_ms * self.backoff_multiplier.powi(attempt as i32);

        // Cap at max delay
        let capped_delay = exponential_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range;
        let final_delay = capped_delay + jitter - (jitter_range / 2.0);

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

/// Retry an async operation with exponential backoff
///
/// Every error is retried until `max_attempts` is exhausted; the last error is
/// returned.
pub async fn retry_with_backoff<F, Fut, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run_with_backoff(config, operation, |_| true).await
}

/// Determine if an error is worth an automatic retry
///
/// Returns true for transient failures: network errors, request timeouts
/// (408), rate limiting (429) and 5xx server errors. Client errors, protocol
/// errors, cancellation, and `Busy` are returned immediately.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Transport(TransportError::Network { .. }) => true,
        Error::Transport(TransportError::Status { status, .. }) => {
            matches!(*status, 408 | 429 | 500..=599)
        }
        _ => false,
    }
}

/// Retry an async operation with exponential backoff, only retrying on
/// errors accepted by [`is_retryable_error`]
pub async fn retry_with_backoff_conditional<F, Fut, T>(
    config: RetryConfig,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run_with_backoff(config, operation, is_retryable_error).await
}

async fn run_with_backoff<F, Fut, T, P>(
    config: RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    if config.max_attempts == 0 {
        return Err(Error::invalid_input("max_attempts must be at least 1"));
    }

    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempt += 1;
                if attempt >= config.max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                let delay = config.calculate_delay(attempt - 1);
                log::debug!(
                    "Attempt {}/{} failed ({}); retrying in {:?}",
                    attempt,
                    config.max_attempts,
                    err,
                    delay
                );
                sleep(delay).await;
            }
        }
    }
}
