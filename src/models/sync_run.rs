//! Sync run model
//!
//! A `SyncRun` records one execution of the paginated ingestion pipeline for
//! one account and operation type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::OperationType;
use super::entity::UpsertSummary;
use crate::error::ErrorKind;

/// Status of a sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    /// Run in progress
    #[default]
    Running,
    /// Run finished normally
    Completed,
    /// Run aborted
    Failed,
}

impl SyncRunStatus {
    /// Whether the status is final
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncRunStatus::Running)
    }
}

impl std::fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncRunStatus::Running => write!(f, "running"),
            SyncRunStatus::Completed => write!(f, "completed"),
            SyncRunStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SyncRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(SyncRunStatus::Running),
            "completed" => Ok(SyncRunStatus::Completed),
            "failed" => Ok(SyncRunStatus::Failed),
            _ => Err(format!("Invalid sync run status: {}", s)),
        }
    }
}

/// One execution of the sync pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    /// Unique run identifier
    pub sync_id: String,

    /// Account the run belongs to
    pub account_id: String,

    /// Operation synchronized
    pub operation_type: OperationType,

    /// Current status
    pub status: SyncRunStatus,

    /// Start time
    pub started_at: DateTime<Utc>,

    /// End time, set on the terminal transition
    pub completed_at: Option<DateTime<Utc>>,

    /// Records seen across all pages
    pub items_processed: u64,

    /// Records inserted
    pub items_created: u64,

    /// Records updated in place
    pub items_updated: u64,

    /// Records that could not be stored
    pub items_failed: u64,

    /// Pages fetched from the remote API
    pub pages_fetched: u32,

    /// Pages skipped because the remote flagged them as failed
    pub pages_failed: u32,

    /// Advisory messages accepted as warnings
    pub warnings: u32,

    /// Kind of the failure that ended the run
    pub error_kind: Option<ErrorKind>,

    /// Failure reason
    pub error_message: Option<String>,
}

impl SyncRun {
    /// Start a new run
    pub fn start(account_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            sync_id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            operation_type,
            status: SyncRunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            items_processed: 0,
            items_created: 0,
            items_updated: 0,
            items_failed: 0,
            pages_fetched: 0,
            pages_failed: 0,
            warnings: 0,
            error_kind: None,
            error_message: None,
        }
    }

    /// Add the outcome of one page's upsert
    pub fn record_page(&mut self, processed: u64, summary: &UpsertSummary) {
        if self.status.is_terminal() {
            return;
        }
        self.items_processed += processed;
        self.items_created += summary.created;
        self.items_updated += summary.updated;
        self.items_failed += summary.failed;
    }

    /// Transition to Completed
    pub fn complete(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SyncRunStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Transition to Failed
    pub fn fail(&mut self, kind: Option<ErrorKind>, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = SyncRunStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_kind = kind;
        self.error_message = Some(message.into());
    }

    /// Run duration in milliseconds, once finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_creates_unique_running_runs() {
        let a = SyncRun::start("acme", OperationType::Offers);
        let b = SyncRun::start("acme", OperationType::Offers);
        assert_ne!(a.sync_id, b.sync_id);
        assert_eq!(a.status, SyncRunStatus::Running);
        assert!(a.completed_at.is_none());
        assert!(a.duration_ms().is_none());
    }

    #[test]
    fn test_record_page_accumulates() {
        let mut run = SyncRun::start("acme", OperationType::Orders);
        run.record_page(
            10,
            &UpsertSummary {
                created: 7,
                updated: 2,
                failed: 1,
                errors: vec![],
            },
        );
        run.record_page(
            5,
            &UpsertSummary {
                created: 0,
                updated: 5,
                failed: 0,
                errors: vec![],
            },
        );
        assert_eq!(run.items_processed, 15);
        assert_eq!(run.items_created, 7);
        assert_eq!(run.items_updated, 7);
        assert_eq!(run.items_failed, 1);
    }

    #[test]
    fn test_terminal_state_is_absorbing() {
        let mut run = SyncRun::start("acme", OperationType::Offers);
        run.fail(Some(ErrorKind::Auth), "invalid token");
        let completed_at = run.completed_at;

        run.complete();
        run.record_page(10, &UpsertSummary::default());

        assert_eq!(run.status, SyncRunStatus::Failed);
        assert_eq!(run.completed_at, completed_at);
        assert_eq!(run.items_processed, 0);
        assert_eq!(run.error_kind, Some(ErrorKind::Auth));
        assert!(run.duration_ms().is_some());
    }

    #[test]
    fn test_status_serialization() {
        let values = vec![
            (SyncRunStatus::Running, r#""running""#),
            (SyncRunStatus::Completed, r#""completed""#),
            (SyncRunStatus::Failed, r#""failed""#),
        ];

        for (value, expected_json) in values {
            let json = serde_json::to_string(&value).unwrap();
            assert_eq!(json, expected_json);
            assert_eq!(value.to_string().parse::<SyncRunStatus>(), Ok(value));
        }
    }
}
