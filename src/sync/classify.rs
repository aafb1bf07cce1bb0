//! Failure classification for marketplace calls
//!
//! Maps HTTP statuses and transport errors onto [`ErrorKind`] so the retry
//! executor and the pipeline can decide what to do without looking at
//! transport details.

use std::time::Duration;

use crate::error::{ClassifiedError, ErrorKind};

/// Largest retry hint accepted from the remote side, in seconds
pub const MAX_RETRY_AFTER_SECS: f64 = 3600.0;

/// Turns raw failures into [`ClassifiedError`]s
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassifier {
    default_retry_after_secs: f64,
    max_retry_after_secs: f64,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(60.0)
    }
}

impl ErrorClassifier {
    /// Create a classifier; `default_retry_after_secs` applies to 429s without a hint
    pub fn new(default_retry_after_secs: f64) -> Self {
        Self {
            default_retry_after_secs,
            max_retry_after_secs: MAX_RETRY_AFTER_SECS,
        }
    }

    /// Cap server retry hints at `secs`
    pub fn with_max_retry_after(mut self, secs: f64) -> Self {
        self.max_retry_after_secs = secs.clamp(0.0, MAX_RETRY_AFTER_SECS);
        self
    }

    /// Classify an HTTP error status
    ///
    /// `retry_after` is the server hint in seconds, already resolved from the
    /// body or the `Retry-After` header by the caller.
    pub fn classify_status(
        &self,
        status: u16,
        retry_after: Option<f64>,
        message: impl Into<String>,
    ) -> ClassifiedError {
        let message = message.into();
        let kind = match status {
            400 => ErrorKind::Validation,
            401 | 403 => ErrorKind::Auth,
            404 | 422 => ErrorKind::Business,
            429 => ErrorKind::RateLimit,
            s if s >= 500 => ErrorKind::Network,
            _ => ErrorKind::Unknown,
        };

        let message = if status == 404 && message.is_empty() {
            "not found".to_string()
        } else {
            message
        };

        let classified = ClassifiedError::new(kind, message).with_status(status);
        if kind == ErrorKind::RateLimit {
            let delay = retry_after
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .unwrap_or(self.default_retry_after_secs)
                .min(self.max_retry_after_secs);
            classified.with_suggested_delay(delay)
        } else {
            classified
        }
    }

    /// Classify a transport failure
    pub fn classify_transport(&self, err: &reqwest::Error) -> ClassifiedError {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() {
            ErrorKind::Network
        } else if err.is_decode() {
            ErrorKind::Unknown
        } else if let Some(status) = err.status() {
            return self.classify_status(status.as_u16(), None, err.to_string());
        } else {
            ErrorKind::Network
        };
        ClassifiedError::new(kind, err.to_string())
    }

    /// Classify an operation that ran past its deadline
    pub fn classify_deadline(&self, elapsed: Duration) -> ClassifiedError {
        ClassifiedError::new(
            ErrorKind::Timeout,
            format!("deadline exceeded after {} ms", elapsed.as_millis()),
        )
    }
}

/// Parse a `Retry-After` header value given in seconds
///
/// HTTP dates are not used by the marketplace and are ignored.
pub fn parse_retry_after(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| secs.min(MAX_RETRY_AFTER_SECS))
}
