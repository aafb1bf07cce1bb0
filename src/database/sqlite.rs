//! SQLite implementation of the Database trait
//!
//! This module provides a SQLite-based implementation of the Database trait
//! using rusqlite and tokio-rusqlite for async operations.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row};
use serde_json::{Map, Value};
use tokio_rusqlite::Connection;
use tracing::warn;

use super::migrations::CREATE_SCHEMA;
use super::Database;
use crate::error::DbError;
use crate::models::{
    EntityRecord, OfferRecord, OperationType, OrderRecord, SyncRun, SyncRunStatus, UpsertSummary,
};

const SYNC_RUN_COLUMNS: &str = r#"
    sync_id, account_id, operation_type, status, started_at, completed_at,
    items_processed, items_created, items_updated, items_failed,
    pages_fetched, pages_failed, warnings, error_kind, error_message
"#;

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).await?;

        // Run migrations
        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }

    /// Fetch the stored status of a run
    async fn stored_status(&self, sync_id: &str) -> Result<Option<String>, DbError> {
        let sync_id = sync_id.to_string();

        self.conn
            .call(move |conn| {
                let status = conn
                    .query_row(
                        "SELECT status FROM sync_runs WHERE sync_id = ?1",
                        [&sync_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(status)
            })
            .await
            .map_err(Into::into)
    }

    /// Explain why a guarded run update touched no rows
    async fn rejected_update(&self, sync_id: &str) -> DbError {
        match self.stored_status(sync_id).await {
            Ok(Some(status)) => DbError::ConstraintViolation(format!(
                "sync run {} is already {}",
                sync_id, status
            )),
            Ok(None) => DbError::NotFound,
            Err(e) => e,
        }
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    // =========================================================================
    // Entity operations
    // =========================================================================

    async fn upsert_chunk(&self, records: &[EntityRecord]) -> Result<UpsertSummary, DbError> {
        if records.is_empty() {
            return Ok(UpsertSummary::default());
        }
        let records = records.to_vec();

        self.conn
            .call(move |conn| {
                let now = Utc::now().to_rfc3339();

                match upsert_in_transaction(conn, &records, &now) {
                    Ok((created, updated)) => Ok(UpsertSummary {
                        created,
                        updated,
                        failed: 0,
                        errors: Vec::new(),
                    }),
                    Err(chunk_err) => {
                        warn!(
                            records = records.len(),
                            error = %chunk_err,
                            "Chunk upsert rolled back, replaying records one by one"
                        );

                        let mut summary = UpsertSummary::default();
                        for record in &records {
                            let tx = conn.transaction()?;
                            match upsert_record(&tx, record, &now) {
                                Ok(true) => {
                                    tx.commit()?;
                                    summary.created += 1;
                                }
                                Ok(false) => {
                                    tx.commit()?;
                                    summary.updated += 1;
                                }
                                Err(e) => {
                                    // Dropping the transaction rolls it back
                                    drop(tx);
                                    summary.failed += 1;
                                    summary.errors.push(format!(
                                        "{} {:?}: {}",
                                        record.operation_type(),
                                        record.external_id(),
                                        e
                                    ));
                                }
                            }
                        }
                        Ok(summary)
                    }
                }
            })
            .await
            .map_err(Into::into)
    }

    async fn get_offer(
        &self,
        account_id: &str,
        external_id: &str,
    ) -> Result<Option<OfferRecord>, DbError> {
        let account_id = account_id.to_string();
        let external_id = external_id.to_string();

        self.conn
            .call(move |conn| {
                let result = conn
                    .query_row(
                        r#"
                        SELECT account_id, external_id, sku, title, price, stock, status, extra
                        FROM offers
                        WHERE account_id = ?1 AND external_id = ?2
                        "#,
                        rusqlite::params![account_id, external_id],
                        |row| {
                            Ok(OfferRecord {
                                account_id: row.get(0)?,
                                external_id: row.get(1)?,
                                sku: row.get(2)?,
                                title: row.get(3)?,
                                price: row.get(4)?,
                                stock: row.get(5)?,
                                status: row.get(6)?,
                                extra: parse_extra(row.get(7)?),
                            })
                        },
                    )
                    .optional()?;

                Ok(result)
            })
            .await
            .map_err(Into::into)
    }

    async fn get_order(
        &self,
        account_id: &str,
        external_id: &str,
    ) -> Result<Option<OrderRecord>, DbError> {
        let account_id = account_id.to_string();
        let external_id = external_id.to_string();

        self.conn
            .call(move |conn| {
                let result = conn
                    .query_row(
                        r#"
                        SELECT account_id, external_id, status, total_amount, currency,
                               buyer_name, item_count, placed_at, extra
                        FROM orders
                        WHERE account_id = ?1 AND external_id = ?2
                        "#,
                        rusqlite::params![account_id, external_id],
                        |row| {
                            Ok(OrderRecord {
                                account_id: row.get(0)?,
                                external_id: row.get(1)?,
                                status: row.get(2)?,
                                total_amount: row.get(3)?,
                                currency: row.get(4)?,
                                buyer_name: row.get(5)?,
                                item_count: row.get(6)?,
                                placed_at: row.get(7)?,
                                extra: parse_extra(row.get(8)?),
                            })
                        },
                    )
                    .optional()?;

                Ok(result)
            })
            .await
            .map_err(Into::into)
    }

    async fn count_entities(
        &self,
        account_id: &str,
        operation: OperationType,
    ) -> Result<u64, DbError> {
        let account_id = account_id.to_string();
        let sql = match operation {
            OperationType::Offers => "SELECT COUNT(*) FROM offers WHERE account_id = ?1",
            OperationType::Orders => "SELECT COUNT(*) FROM orders WHERE account_id = ?1",
        };

        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(sql, [&account_id], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Sync run operations
    // =========================================================================

    async fn begin_sync_run(&self, run: &SyncRun) -> Result<(), DbError> {
        if run.status != SyncRunStatus::Running {
            return Err(DbError::ConstraintViolation(format!(
                "sync run {} must start as running",
                run.sync_id
            )));
        }

        let run = run.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO sync_runs
                    (sync_id, account_id, operation_type, status, started_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    rusqlite::params![
                        run.sync_id,
                        run.account_id,
                        run.operation_type.to_string(),
                        run.status.to_string(),
                        run.started_at.to_rfc3339()
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn update_sync_run(&self, run: &SyncRun) -> Result<(), DbError> {
        let sync_id = run.sync_id.clone();
        let counters = RunCounters::from(run);

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE sync_runs SET
                        items_processed = ?2, items_created = ?3, items_updated = ?4,
                        items_failed = ?5, pages_fetched = ?6, pages_failed = ?7, warnings = ?8
                    WHERE sync_id = ?1 AND status = 'running'
                    "#,
                    rusqlite::params![
                        sync_id,
                        counters.items_processed,
                        counters.items_created,
                        counters.items_updated,
                        counters.items_failed,
                        counters.pages_fetched,
                        counters.pages_failed,
                        counters.warnings
                    ],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(self.rejected_update(&run.sync_id).await);
        }

        Ok(())
    }

    async fn complete_sync_run(&self, run: &SyncRun) -> Result<(), DbError> {
        if !run.status.is_terminal() {
            return Err(DbError::ConstraintViolation(format!(
                "sync run {} is not in a terminal state",
                run.sync_id
            )));
        }

        let sync_id = run.sync_id.clone();
        let status = run.status.to_string();
        let completed_at = run.completed_at.unwrap_or_else(Utc::now).to_rfc3339();
        let error_kind = run.error_kind.map(|k| k.to_string());
        let error_message = run.error_message.clone();
        let counters = RunCounters::from(run);

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE sync_runs SET
                        status = ?2, completed_at = ?3,
                        items_processed = ?4, items_created = ?5, items_updated = ?6,
                        items_failed = ?7, pages_fetched = ?8, pages_failed = ?9, warnings = ?10,
                        error_kind = ?11, error_message = ?12
                    WHERE sync_id = ?1 AND status = 'running'
                    "#,
                    rusqlite::params![
                        sync_id,
                        status,
                        completed_at,
                        counters.items_processed,
                        counters.items_created,
                        counters.items_updated,
                        counters.items_failed,
                        counters.pages_fetched,
                        counters.pages_failed,
                        counters.warnings,
                        error_kind,
                        error_message
                    ],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(self.rejected_update(&run.sync_id).await);
        }

        Ok(())
    }

    async fn get_sync_run(&self, sync_id: &str) -> Result<Option<SyncRun>, DbError> {
        let sync_id = sync_id.to_string();

        self.conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM sync_runs WHERE sync_id = ?1", SYNC_RUN_COLUMNS);
                let result = conn
                    .query_row(&sql, [&sync_id], row_to_sync_run)
                    .optional()?;

                Ok(result)
            })
            .await
            .map_err(Into::into)
    }

    async fn list_sync_runs(
        &self,
        account_id: Option<String>,
        limit: u32,
    ) -> Result<Vec<SyncRun>, DbError> {
        self.conn
            .call(move |conn| {
                let runs = match account_id {
                    Some(account_id) => {
                        let sql = format!(
                            "SELECT {} FROM sync_runs WHERE account_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
                            SYNC_RUN_COLUMNS
                        );
                        let mut stmt = conn.prepare(&sql)?;
                        let rows = stmt
                            .query_map(rusqlite::params![account_id, limit], row_to_sync_run)?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let sql = format!(
                            "SELECT {} FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
                            SYNC_RUN_COLUMNS
                        );
                        let mut stmt = conn.prepare(&sql)?;
                        let rows = stmt
                            .query_map([limit], row_to_sync_run)?
                            .collect::<Result<Vec<_>, _>>()?;
                        rows
                    }
                };

                Ok(runs)
            })
            .await
            .map_err(Into::into)
    }
}

/// Run counters converted to SQLite integers
struct RunCounters {
    items_processed: i64,
    items_created: i64,
    items_updated: i64,
    items_failed: i64,
    pages_fetched: i64,
    pages_failed: i64,
    warnings: i64,
}

impl From<&SyncRun> for RunCounters {
    fn from(run: &SyncRun) -> Self {
        Self {
            items_processed: run.items_processed as i64,
            items_created: run.items_created as i64,
            items_updated: run.items_updated as i64,
            items_failed: run.items_failed as i64,
            pages_fetched: run.pages_fetched as i64,
            pages_failed: run.pages_failed as i64,
            warnings: run.warnings as i64,
        }
    }
}

/// Upsert every record in one transaction, returning (created, updated)
fn upsert_in_transaction(
    conn: &mut rusqlite::Connection,
    records: &[EntityRecord],
    now: &str,
) -> rusqlite::Result<(u64, u64)> {
    let tx = conn.transaction()?;
    let mut created = 0;
    let mut updated = 0;

    for record in records {
        if upsert_record(&tx, record, now)? {
            created += 1;
        } else {
            updated += 1;
        }
    }

    tx.commit()?;
    Ok((created, updated))
}

/// Upsert one record, returning true when a new row was inserted
fn upsert_record(
    conn: &rusqlite::Connection,
    record: &EntityRecord,
    now: &str,
) -> rusqlite::Result<bool> {
    match record {
        EntityRecord::Offer(offer) => {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM offers WHERE account_id = ?1 AND external_id = ?2",
                    rusqlite::params![offer.account_id, offer.external_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            conn.execute(
                r#"
                INSERT INTO offers
                (account_id, external_id, sku, title, price, stock, status, extra, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                ON CONFLICT(account_id, external_id) DO UPDATE SET
                    sku = excluded.sku,
                    title = excluded.title,
                    price = excluded.price,
                    stock = excluded.stock,
                    status = excluded.status,
                    extra = excluded.extra,
                    updated_at = excluded.updated_at
                "#,
                rusqlite::params![
                    offer.account_id,
                    offer.external_id,
                    offer.sku,
                    offer.title,
                    offer.price,
                    offer.stock,
                    offer.status,
                    encode_extra(&offer.extra)?,
                    now
                ],
            )?;
            Ok(!exists)
        }
        EntityRecord::Order(order) => {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM orders WHERE account_id = ?1 AND external_id = ?2",
                    rusqlite::params![order.account_id, order.external_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            conn.execute(
                r#"
                INSERT INTO orders
                (account_id, external_id, status, total_amount, currency, buyer_name,
                 item_count, placed_at, extra, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                ON CONFLICT(account_id, external_id) DO UPDATE SET
                    status = excluded.status,
                    total_amount = excluded.total_amount,
                    currency = excluded.currency,
                    buyer_name = excluded.buyer_name,
                    item_count = excluded.item_count,
                    placed_at = excluded.placed_at,
                    extra = excluded.extra,
                    updated_at = excluded.updated_at
                "#,
                rusqlite::params![
                    order.account_id,
                    order.external_id,
                    order.status,
                    order.total_amount,
                    order.currency,
                    order.buyer_name,
                    order.item_count,
                    order.placed_at,
                    encode_extra(&order.extra)?,
                    now
                ],
            )?;
            Ok(!exists)
        }
    }
}

fn encode_extra(extra: &Map<String, Value>) -> rusqlite::Result<String> {
    serde_json::to_string(extra).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_extra(s: String) -> Map<String, Value> {
    serde_json::from_str(&s).unwrap_or_default()
}

fn row_to_sync_run(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    Ok(SyncRun {
        sync_id: row.get(0)?,
        account_id: row.get(1)?,
        operation_type: parse_column(2, row.get(2)?)?,
        status: parse_column(3, row.get(3)?)?,
        started_at: parse_datetime(row.get::<_, Option<String>>(4)?).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(4, Type::Text, "invalid started_at".into())
        })?,
        completed_at: parse_datetime(row.get::<_, Option<String>>(5)?),
        items_processed: row.get::<_, i64>(6)? as u64,
        items_created: row.get::<_, i64>(7)? as u64,
        items_updated: row.get::<_, i64>(8)? as u64,
        items_failed: row.get::<_, i64>(9)? as u64,
        pages_fetched: row.get::<_, i64>(10)? as u32,
        pages_failed: row.get::<_, i64>(11)? as u32,
        warnings: row.get::<_, i64>(12)? as u32,
        error_kind: row
            .get::<_, Option<String>>(13)?
            .and_then(|s| s.parse().ok()),
        error_message: row.get(14)?,
    })
}

/// Parse a text column through `FromStr`
fn parse_column<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Parse a datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}
