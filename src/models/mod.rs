//! Domain models for marketplace-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod account;
pub mod api;
pub mod batch;
pub mod entity;
pub mod sync_run;

// Re-export commonly used types
pub use account::{AccountCredentials, AccountSchedule, OperationType, ScheduleStatus};
pub use api::{ApiMessage, BatchRequest, BatchResponse, PageRequest, PageResponse};
pub use batch::{BatchResult, WriteOperation};
pub use entity::{EntityRecord, OfferRecord, OrderRecord, UpsertSummary};
pub use sync_run::{SyncRun, SyncRunStatus};
