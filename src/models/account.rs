//! Account-related domain models
//!
//! This module defines operation types, marketplace credentials and the
//! per-account schedule state owned by the scheduler.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::rate_limiter::OperationClass;

/// Paginated read operation synchronized from the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Offer catalog
    Offers,
    /// Orders
    Orders,
}

impl OperationType {
    /// Remote resource path segment
    pub fn resource(&self) -> &'static str {
        match self {
            OperationType::Offers => "offers",
            OperationType::Orders => "orders",
        }
    }

    /// Rate limit class guarding this operation
    pub fn rate_class(&self) -> OperationClass {
        match self {
            OperationType::Orders => OperationClass::Orders,
            OperationType::Offers => OperationClass::Other,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.resource())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offers" => Ok(OperationType::Offers),
            "orders" => Ok(OperationType::Orders),
            _ => Err(format!("Invalid operation type: {}", s)),
        }
    }
}

/// Marketplace API credentials for one seller account
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCredentials {
    /// Bearer token sent with every request
    pub api_key: String,

    /// Seller identifier, sent as `X-Seller-Id` when present
    #[serde(default)]
    pub seller_id: Option<String>,
}

impl AccountCredentials {
    /// Create credentials from an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            seller_id: None,
        }
    }

    /// Set the seller identifier
    pub fn with_seller_id(mut self, seller_id: impl Into<String>) -> Self {
        self.seller_id = Some(seller_id.into());
        self
    }
}

impl std::fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("api_key", &"***")
            .field("seller_id", &self.seller_id)
            .finish()
    }
}

/// Status of an account schedule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Never run
    #[default]
    Idle,
    /// A cycle is in flight
    Running,
    /// Last cycle completed
    Completed,
    /// Last cycle failed
    Failed,
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleStatus::Idle => write!(f, "idle"),
            ScheduleStatus::Running => write!(f, "running"),
            ScheduleStatus::Completed => write!(f, "completed"),
            ScheduleStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Schedule state for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSchedule {
    /// Account identifier
    pub account_id: String,

    /// Seconds between the end of one cycle and the start of the next
    pub interval_secs: u64,

    /// Operations synchronized on every cycle
    pub operation_types: BTreeSet<OperationType>,

    /// Current status
    pub status: ScheduleStatus,

    /// Completion time of the last cycle
    pub last_sync_at: Option<DateTime<Utc>>,

    /// Earliest time the next automatic cycle may start
    pub next_sync_at: DateTime<Utc>,

    /// Automatic cycles are suspended after an authentication failure
    pub halted: bool,

    /// Failure reason of the last cycle
    pub last_error: Option<String>,
}

impl AccountSchedule {
    /// Create a schedule whose first cycle is due at `first_run_at`
    pub fn new(
        account_id: impl Into<String>,
        interval_secs: u64,
        operation_types: BTreeSet<OperationType>,
        first_run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            interval_secs,
            operation_types,
            status: ScheduleStatus::Idle,
            last_sync_at: None,
            next_sync_at: first_run_at,
            halted: false,
            last_error: None,
        }
    }

    /// Whether an automatic cycle should start at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.halted && self.status != ScheduleStatus::Running && now >= self.next_sync_at
    }

    /// Mark a cycle as started
    pub fn mark_running(&mut self) {
        self.status = ScheduleStatus::Running;
    }

    /// Record the end of a cycle
    ///
    /// The next cycle is due `interval_secs` after `completed_at`. The next sync
    /// time never moves backwards.
    pub fn record_completion(
        &mut self,
        completed_at: DateTime<Utc>,
        succeeded: bool,
        error: Option<String>,
    ) {
        self.status = if succeeded {
            ScheduleStatus::Completed
        } else {
            ScheduleStatus::Failed
        };
        self.last_sync_at = Some(completed_at);
        self.last_error = error;

        let next = completed_at + Duration::seconds(self.interval_secs as i64);
        if next > self.next_sync_at {
            self.next_sync_at = next;
        }
    }

    /// Suspend automatic cycles until a manual run succeeds
    pub fn halt(&mut self, reason: impl Into<String>) {
        self.halted = true;
        self.last_error = Some(reason.into());
    }

    /// Resume automatic cycles
    pub fn resume(&mut self) {
        self.halted = false;
    }
}
