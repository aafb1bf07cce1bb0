//! Application error types for marketplace-sync
//!
//! This module defines the error taxonomy shared by the rate limiter, the
//! retry executor, the sync pipeline and the storage layer.
//! All error types use `thiserror` for ergonomic error handling.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Kind of a classified marketplace failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Remote side throttled the request (HTTP 429)
    RateLimit,
    /// Credentials rejected (HTTP 401/403)
    Auth,
    /// Request payload rejected (HTTP 400)
    Validation,
    /// Transport failure or server error (HTTP 5xx)
    Network,
    /// Operation deadline exceeded
    Timeout,
    /// Business rule rejection (HTTP 404/422)
    Business,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Whether failures of this kind are retried by default
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::RateLimit => write!(f, "rate_limit"),
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Business => write!(f, "business"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rate_limit" => Ok(ErrorKind::RateLimit),
            "auth" => Ok(ErrorKind::Auth),
            "validation" => Ok(ErrorKind::Validation),
            "network" => Ok(ErrorKind::Network),
            "timeout" => Ok(ErrorKind::Timeout),
            "business" => Ok(ErrorKind::Business),
            "unknown" => Ok(ErrorKind::Unknown),
            _ => Err(format!("Invalid error kind: {}", s)),
        }
    }
}

/// A transport or API failure normalized into the retry taxonomy
///
/// Created once per failed attempt and never mutated afterwards.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{kind} error: {raw_message}")]
pub struct ClassifiedError {
    /// Failure kind
    pub kind: ErrorKind,
    /// Whether the failure may be retried
    pub retryable: bool,
    /// Delay requested by the remote side, in seconds
    pub suggested_delay_secs: Option<f64>,
    /// Original error text
    pub raw_message: String,
    /// HTTP status when the failure came from a response
    pub http_status: Option<u16>,
}

impl ClassifiedError {
    /// Create a classified error with the default retryability of its kind
    pub fn new(kind: ErrorKind, raw_message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_transient(),
            suggested_delay_secs: None,
            raw_message: raw_message.into(),
            http_status: None,
        }
    }

    /// Attach the HTTP status
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Attach a server-suggested delay
    pub fn with_suggested_delay(mut self, secs: f64) -> Self {
        self.suggested_delay_secs = Some(secs);
        self
    }
}

/// Errors raised by the local rate limiter
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RateLimitError {
    /// The per-minute window is full for longer than the caller is willing to wait
    #[error("Rate limit window exhausted for {class}, retry in {remaining_secs:.1} seconds")]
    WindowExhausted { class: String, remaining_secs: f64 },

    /// Tokens did not become available before the timeout
    #[error("Timed out waiting for {class} tokens after {waited_ms} ms")]
    Timeout { class: String, waited_ms: u64 },

    /// The request can never be satisfied by the bucket
    #[error("Cost {cost} exceeds bucket capacity {capacity} for {class}")]
    CostExceedsCapacity {
        class: String,
        cost: u32,
        capacity: u32,
    },
}

impl RateLimitError {
    /// Seconds until the limiter could admit the request, when known
    pub fn remaining_secs(&self) -> Option<f64> {
        match self {
            RateLimitError::WindowExhausted { remaining_secs, .. } => Some(*remaining_secs),
            _ => None,
        }
    }
}

impl From<RateLimitError> for ClassifiedError {
    fn from(err: RateLimitError) -> Self {
        let mut classified = ClassifiedError::new(ErrorKind::RateLimit, err.to_string());
        match &err {
            RateLimitError::CostExceedsCapacity { .. } => classified.retryable = false,
            RateLimitError::WindowExhausted { remaining_secs, .. } => {
                classified.suggested_delay_secs = Some(*remaining_secs);
            }
            RateLimitError::Timeout { .. } => {}
        }
        classified
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection-level error from the async wrapper
    #[error("Database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Stored value could not be decoded
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

/// Synchronization-related errors
#[derive(Debug, Error)]
pub enum SyncError {
    /// Classified marketplace failure
    #[error("API error: {0}")]
    Api(#[from] ClassifiedError),

    /// Page response carried no error indicator
    #[error("Page {page} response is missing the error indicator")]
    MissingErrorIndicator { page: u32 },

    /// Storage failure
    #[error("Storage error: {0}")]
    Database(#[from] DbError),

    /// Run cancelled by shutdown or timeout
    #[error("Sync cancelled")]
    Cancelled,

    /// Account is not configured
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Account already has a run in flight
    #[error("Account {0} is already syncing")]
    AlreadyRunning(String),

    /// Scheduler task is not accepting requests
    #[error("Scheduler not running")]
    SchedulerStopped,

    /// Cycle task panicked or was aborted before reporting
    #[error("Sync cycle aborted: {0}")]
    CycleAborted(String),
}

/// Application-level error type
///
/// This is the main error type used throughout the application.
/// It aggregates all domain-specific error types.
#[derive(Debug, Error)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Rate limiter error
    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;

    /// Classified kind, used to filter against a policy's retryable kinds
    fn kind(&self) -> Option<ErrorKind> {
        None
    }

    /// Delay requested by the remote side
    fn suggested_delay(&self) -> Option<Duration> {
        None
    }
}

impl RetryableError for ClassifiedError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn kind(&self) -> Option<ErrorKind> {
        Some(self.kind)
    }

    fn suggested_delay(&self) -> Option<Duration> {
        self.suggested_delay_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}
