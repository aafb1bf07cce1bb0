//! Retry policy for transient marketplace failures
//!
//! Retries are driven by an explicit executor over a closure. Delays come
//! from the server hint when one is present and from exponential backoff
//! otherwise.

use crate::config::RetryConfig;
use crate::error::{ErrorKind, RetryableError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy with exponential backoff support
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new RetryPolicy with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create a RetryPolicy with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Execute an async operation with retry logic
    ///
    /// A failure is retried when it reports itself retryable, its kind is in
    /// the policy's retryable kinds, and attempts are left. The last error is
    /// returned once retries are exhausted.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !self.should_retry(&err) {
                        return Err(err);
                    }
                    if attempt >= self.config.max_retries {
                        warn!(
                            attempts = attempt + 1,
                            max_retries = self.config.max_retries,
                            error = %err,
                            "Max retries exhausted"
                        );
                        return Err(err);
                    }

                    let backoff = err
                        .suggested_delay()
                        .unwrap_or_else(|| self.calculate_backoff(attempt));
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Retrying after transient error"
                    );

                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn should_retry<E: RetryableError>(&self, err: &E) -> bool {
        if !err.is_retryable() {
            return false;
        }
        match err.kind() {
            Some(kind) => self.is_retryable_kind(kind),
            None => true,
        }
    }

    /// Whether the policy retries failures of `kind`
    pub fn is_retryable_kind(&self, kind: ErrorKind) -> bool {
        self.config.retryable_kinds.contains(&kind)
    }

    /// Calculate backoff duration for a given attempt number
    ///
    /// Uses exponential backoff: base_delay * multiplier^attempt, capped at
    /// max_delay. Jitter adds up to 10% and never exceeds the cap.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_secs * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_delay_secs).max(0.0);

        let delay = if self.config.jitter && capped > 0.0 {
            let jitter = rand::thread_rng().gen_range(1.0..1.1);
            (capped * jitter).min(self.config.max_delay_secs)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }

    /// Get the retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}
