//! Database layer for marketplace-sync
//!
//! This module defines the database trait and SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;

use crate::error::DbError;
use crate::models::{EntityRecord, OfferRecord, OperationType, OrderRecord, SyncRun, UpsertSummary};

/// Database trait for data persistence
///
/// This trait defines all database operations needed by the application.
/// It uses `async_trait` for async methods and `mockall::automock` for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Database: Send + Sync {
    // =========================================================================
    // Entity operations
    // =========================================================================

    /// Insert or update a chunk of records keyed by `(account_id, external_id)`
    ///
    /// The chunk is written in one transaction. If any record fails, that
    /// transaction is rolled back and the chunk is replayed one record per
    /// transaction, so only the failing records are lost.
    async fn upsert_chunk(&self, records: &[EntityRecord]) -> Result<UpsertSummary, DbError>;

    /// Get an offer by its natural key
    async fn get_offer(
        &self,
        account_id: &str,
        external_id: &str,
    ) -> Result<Option<OfferRecord>, DbError>;

    /// Get an order by its natural key
    async fn get_order(
        &self,
        account_id: &str,
        external_id: &str,
    ) -> Result<Option<OrderRecord>, DbError>;

    /// Count stored records of an operation type for an account
    async fn count_entities(
        &self,
        account_id: &str,
        operation: OperationType,
    ) -> Result<u64, DbError>;

    // =========================================================================
    // Sync run operations
    // =========================================================================

    /// Persist a freshly started run
    async fn begin_sync_run(&self, run: &SyncRun) -> Result<(), DbError>;

    /// Persist the counters of a running run
    ///
    /// Fails with `ConstraintViolation` once the stored run is terminal.
    async fn update_sync_run(&self, run: &SyncRun) -> Result<(), DbError>;

    /// Persist the terminal state of a run
    ///
    /// `run` must be terminal; a stored run can only be completed once.
    async fn complete_sync_run(&self, run: &SyncRun) -> Result<(), DbError>;

    /// Get a run by id
    async fn get_sync_run(&self, sync_id: &str) -> Result<Option<SyncRun>, DbError>;

    /// Most recent runs first, optionally for one account
    async fn list_sync_runs(
        &self,
        account_id: Option<String>,
        limit: u32,
    ) -> Result<Vec<SyncRun>, DbError>;
}
