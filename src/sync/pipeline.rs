//! Paginated ingestion of one account's offers or orders
//!
//! Each run fetches pages in order, validates them, maps the raw records and
//! upserts them in chunks. The run row is persisted when it starts, after
//! every page and at its terminal transition, so a failed run leaves its
//! committed pages in place.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::batch::split_batches;
use super::gateway::ApiGateway;
use super::mapping::map_record;
use super::validation::{PageVerdict, ResponseValidator};
use crate::config::{AccountConfig, PipelineConfig};
use crate::database::Database;
use crate::error::{ClassifiedError, ErrorKind, SyncError};
use crate::models::{OperationType, PageRequest, SyncRun, UpsertSummary};

/// Runs one synchronization of an account and operation type
#[async_trait]
pub trait AccountSyncer: Send + Sync {
    /// Synchronize `operation` for `account`
    ///
    /// Returns the terminal run. `Err` means the run could not be recorded
    /// at all.
    async fn sync_account(
        &self,
        account: &AccountConfig,
        operation: OperationType,
        cancel: CancellationToken,
    ) -> Result<SyncRun, SyncError>;
}

/// Fetch, validate, map and upsert pipeline
pub struct SyncPipeline {
    gateway: Arc<ApiGateway>,
    database: Arc<dyn Database>,
    config: PipelineConfig,
    validator: ResponseValidator,
}

/// Where the page loop goes after a skipped page
enum Skip {
    Next,
    Stop,
}

impl SyncPipeline {
    /// Create a pipeline
    pub fn new(gateway: Arc<ApiGateway>, database: Arc<dyn Database>, config: PipelineConfig) -> Self {
        let validator = ResponseValidator::new(
            config.advisory_codes.clone(),
            config.advisory_keywords.clone(),
        );
        Self {
            gateway,
            database,
            config,
            validator,
        }
    }

    async fn page_loop(
        &self,
        account: &AccountConfig,
        operation: OperationType,
        cancel: &CancellationToken,
        run: &mut SyncRun,
    ) -> Result<(), SyncError> {
        let items_per_page = account
            .items_per_page
            .unwrap_or(self.config.items_per_page)
            .max(1);
        let max_pages = account.max_pages.unwrap_or(self.config.max_pages);
        let mut consecutive_failures = 0u32;
        let mut page = 1u32;

        while page <= max_pages {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let request = PageRequest {
                credentials: account.credentials.clone(),
                operation,
                page,
                items_per_page,
                filters: account.filters.clone(),
            };

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = self.gateway.fetch_page(&request) => result,
            };

            let response = match fetched {
                Ok(response) => response,
                Err(e) if e.kind == ErrorKind::Auth || e.retryable => {
                    return Err(SyncError::Api(e));
                }
                Err(e) => {
                    warn!(
                        account_id = %account.id,
                        operation = %operation,
                        page = page,
                        error = %e,
                        "Page fetch failed, skipping page"
                    );
                    let skip = self
                        .skip_page(run, &mut consecutive_failures, e.kind, None, page, max_pages)
                        .await?;
                    if let Skip::Stop = skip {
                        break;
                    }
                    page += 1;
                    self.page_delay(cancel).await?;
                    continue;
                }
            };
            run.pages_fetched += 1;

            let verdict = match self.validator.validate(&response, page) {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!(
                        account_id = %account.id,
                        operation = %operation,
                        page = page,
                        "Page response has no error indicator, aborting run"
                    );
                    return Err(e);
                }
            };

            match verdict {
                PageVerdict::Clean => {}
                PageVerdict::Advisory(count) => {
                    run.warnings += count;
                    let notes: Vec<String> =
                        response.messages.iter().map(ToString::to_string).collect();
                    warn!(
                        account_id = %account.id,
                        page = page,
                        messages = %notes.join("; "),
                        "Accepting page with advisory messages"
                    );
                }
                PageVerdict::Rejected(messages) => {
                    warn!(
                        account_id = %account.id,
                        operation = %operation,
                        page = page,
                        messages = %messages.join("; "),
                        "Remote flagged page as failed, skipping page"
                    );
                    let skip = self
                        .skip_page(
                            run,
                            &mut consecutive_failures,
                            ErrorKind::Business,
                            response.has_more,
                            page,
                            max_pages,
                        )
                        .await?;
                    if let Skip::Stop = skip {
                        break;
                    }
                    page += 1;
                    self.page_delay(cancel).await?;
                    continue;
                }
            }
            consecutive_failures = 0;

            let received = response.results.len();
            let summary = self.store_page(&account.id, operation, &response.results).await?;
            for message in &summary.errors {
                warn!(account_id = %account.id, page = page, error = %message, "Record not stored");
            }
            run.record_page(received as u64, &summary);
            self.database.update_sync_run(run).await?;

            let last_page = received < items_per_page as usize
                || response.has_more == Some(false)
                || page >= max_pages;
            if last_page {
                break;
            }

            page += 1;
            self.page_delay(cancel).await?;
        }

        Ok(())
    }

    /// Count a skipped page and decide whether the loop goes on
    async fn skip_page(
        &self,
        run: &mut SyncRun,
        consecutive_failures: &mut u32,
        kind: ErrorKind,
        has_more: Option<bool>,
        page: u32,
        max_pages: u32,
    ) -> Result<Skip, SyncError> {
        run.pages_failed += 1;
        *consecutive_failures += 1;
        self.database.update_sync_run(run).await?;

        if *consecutive_failures >= self.config.max_consecutive_page_failures.max(1) {
            return Err(SyncError::Api(ClassifiedError::new(
                kind,
                format!(
                    "{} consecutive pages failed, last at page {}",
                    consecutive_failures, page
                ),
            )));
        }

        if has_more == Some(false) || page >= max_pages {
            Ok(Skip::Stop)
        } else {
            Ok(Skip::Next)
        }
    }

    async fn page_delay(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        if self.config.page_delay_ms == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(self.config.page_delay_ms)) => Ok(()),
        }
    }

    /// Map a page and upsert it chunk by chunk
    async fn store_page(
        &self,
        account_id: &str,
        operation: OperationType,
        results: &[Value],
    ) -> Result<UpsertSummary, SyncError> {
        let mut summary = UpsertSummary::default();
        let mut records = Vec::with_capacity(results.len());

        for (index, raw) in results.iter().enumerate() {
            match map_record(operation, account_id, raw) {
                Ok(record) => records.push(record),
                Err(e) => {
                    summary.failed += 1;
                    summary.errors.push(format!("record {}: {}", index, e));
                }
            }
        }

        for chunk in split_batches(&records, self.config.chunk_size) {
            summary.merge(self.database.upsert_chunk(chunk).await?);
        }

        Ok(summary)
    }
}

/// Error kind recorded on a failed run
fn failure_kind(err: &SyncError) -> Option<ErrorKind> {
    match err {
        SyncError::Api(e) => Some(e.kind),
        SyncError::MissingErrorIndicator { .. } => Some(ErrorKind::Validation),
        _ => None,
    }
}

#[async_trait]
impl AccountSyncer for SyncPipeline {
    async fn sync_account(
        &self,
        account: &AccountConfig,
        operation: OperationType,
        cancel: CancellationToken,
    ) -> Result<SyncRun, SyncError> {
        let mut run = SyncRun::start(&account.id, operation);
        self.database.begin_sync_run(&run).await?;
        info!(
            sync_id = %run.sync_id,
            account_id = %account.id,
            operation = %operation,
            "Sync run started"
        );

        match self.page_loop(account, operation, &cancel, &mut run).await {
            Ok(()) => run.complete(),
            Err(e) => run.fail(failure_kind(&e), e.to_string()),
        }
        self.database.complete_sync_run(&run).await?;

        if run.error_message.is_some() {
            warn!(
                sync_id = %run.sync_id,
                account_id = %account.id,
                operation = %operation,
                pages_fetched = run.pages_fetched,
                items_processed = run.items_processed,
                error = run.error_message.as_deref().unwrap_or_default(),
                "Sync run failed"
            );
        } else {
            info!(
                sync_id = %run.sync_id,
                account_id = %account.id,
                operation = %operation,
                pages_fetched = run.pages_fetched,
                items_processed = run.items_processed,
                items_created = run.items_created,
                items_updated = run.items_updated,
                items_failed = run.items_failed,
                duration_ms = run.duration_ms().unwrap_or_default(),
                "Sync run completed"
            );
        }

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassLimitConfig, RateLimitsConfig, RetryConfig};
    use crate::database::SqliteDatabase;
    use crate::models::{AccountCredentials, ApiMessage, PageResponse, SyncRunStatus};
    use crate::sync::gateway::MockMarketplaceApi;
    use crate::sync::rate_limiter::RateLimiter;
    use crate::sync::retry::RetryPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gateway(api: MockMarketplaceApi) -> Arc<ApiGateway> {
        let limiter = Arc::new(RateLimiter::new(&RateLimitsConfig {
            orders: ClassLimitConfig::new(1000.0, 10, 10_000),
            other: ClassLimitConfig::new(1000.0, 10, 10_000),
            poll_interval_ms: 1,
            jitter_max_ms: 0,
        }));
        let retry = RetryPolicy::new(RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        });
        Arc::new(ApiGateway::new(Arc::new(api), limiter, retry, None))
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            items_per_page: 2,
            chunk_size: 1,
            page_delay_ms: 0,
            ..PipelineConfig::default()
        }
    }

    fn account() -> AccountConfig {
        AccountConfig::new("acme", AccountCredentials::new("key"))
    }

    fn clean_page(ids: &[&str]) -> PageResponse {
        priced_page(ids, "9.90")
    }

    fn priced_page(ids: &[&str], price: &str) -> PageResponse {
        PageResponse {
            results: ids
                .iter()
                .map(|id| json!({"id": id, "sku": format!("SKU-{}", id), "price": price}))
                .collect(),
            is_error: Some(false),
            ..Default::default()
        }
    }

    /// Mock API that serves `pages` in order, 1-based
    fn paged_api(pages: Vec<PageResponse>) -> MockMarketplaceApi {
        let mut api = MockMarketplaceApi::new();
        api.expect_fetch_page().returning(move |request| {
            Ok(pages
                .get(request.page as usize - 1)
                .cloned()
                .unwrap_or_else(|| clean_page(&[])))
        });
        api
    }

    async fn setup(
        api: MockMarketplaceApi,
        config: PipelineConfig,
    ) -> (SyncPipeline, Arc<SqliteDatabase>) {
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let pipeline = SyncPipeline::new(gateway(api), db.clone(), config);
        (pipeline, db)
    }

    // Test 1: Short page ends a successful run
    #[tokio::test]
    async fn test_paginated_run_completes() {
        let api = paged_api(vec![
            clean_page(&["A-1", "A-2"]),
            clean_page(&["A-3", "A-4"]),
            clean_page(&["A-5"]),
        ]);
        let (pipeline, db) = setup(api, pipeline_config()).await;

        let run = pipeline
            .sync_account(&account(), OperationType::Offers, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, SyncRunStatus::Completed);
        assert_eq!(run.pages_fetched, 3);
        assert_eq!(run.items_processed, 5);
        assert_eq!(run.items_created, 5);
        assert!(run.completed_at.is_some());
        assert_eq!(db.count_entities("acme", OperationType::Offers).await.unwrap(), 5);

        let stored = db.get_sync_run(&run.sync_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncRunStatus::Completed);
        assert_eq!(stored.items_created, 5);
    }

    // Test 2: A second run updates rows in place
    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let pages = vec![clean_page(&["A-1", "A-2"]), clean_page(&["A-3"])];
        let (pipeline, db) = setup(paged_api(pages), pipeline_config()).await;
        pipeline
            .sync_account(&account(), OperationType::Offers, CancellationToken::new())
            .await
            .unwrap();

        let repriced = vec![priced_page(&["A-1", "A-2"], "12.50"), priced_page(&["A-3"], "12.50")];
        let pipeline = SyncPipeline::new(gateway(paged_api(repriced)), db.clone(), pipeline_config());
        let second = pipeline
            .sync_account(&account(), OperationType::Offers, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(second.items_created, 0);
        assert_eq!(second.items_updated, 3);
        assert_eq!(db.list_sync_runs(Some("acme".to_string()), 10).await.unwrap().len(), 2);
        assert_eq!(db.count_entities("acme", OperationType::Offers).await.unwrap(), 3);

        let offer = db.get_offer("acme", "A-2").await.unwrap().unwrap();
        assert!((offer.price - 12.50).abs() < f64::EPSILON);
    }

    // Test 3: Missing indicator fails the run, earlier pages stay committed
    #[tokio::test]
    async fn test_missing_indicator_fails_run() {
        let mut broken = clean_page(&["A-3", "A-4"]);
        broken.is_error = None;
        let api = paged_api(vec![clean_page(&["A-1", "A-2"]), broken]);
        let (pipeline, db) = setup(api, pipeline_config()).await;

        let run = pipeline
            .sync_account(&account(), OperationType::Offers, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, SyncRunStatus::Failed);
        assert_eq!(run.error_kind, Some(ErrorKind::Validation));
        assert!(run.error_message.unwrap().contains("error indicator"));
        assert_eq!(run.items_processed, 2);
        assert_eq!(db.count_entities("acme", OperationType::Offers).await.unwrap(), 2);
        assert!(db.get_offer("acme", "A-3").await.unwrap().is_none());
    }

    // Test 4: Advisory messages are warnings, records are stored
    #[tokio::test]
    async fn test_advisory_page_is_stored() {
        let mut advisory = clean_page(&["A-1"]);
        advisory.is_error = Some(true);
        advisory.messages = vec![ApiMessage::text("Missing documentation for attribute")];
        let (pipeline, db) = setup(paged_api(vec![advisory]), pipeline_config()).await;

        let run = pipeline
            .sync_account(&account(), OperationType::Offers, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, SyncRunStatus::Completed);
        assert_eq!(run.warnings, 1);
        assert_eq!(run.items_created, 1);
        assert!(db.get_offer("acme", "A-1").await.unwrap().is_some());
    }

    // Test 5: A rejected page is skipped and the run goes on
    #[tokio::test]
    async fn test_rejected_page_skipped() {
        let mut rejected = clean_page(&["A-3", "A-4"]);
        rejected.is_error = Some(true);
        rejected.messages = vec![ApiMessage::with_code("E500", "internal failure")];
        let api = paged_api(vec![
            clean_page(&["A-1", "A-2"]),
            rejected,
            clean_page(&["A-5"]),
        ]);
        let (pipeline, db) = setup(api, pipeline_config()).await;

        let run = pipeline
            .sync_account(&account(), OperationType::Offers, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, SyncRunStatus::Completed);
        assert_eq!(run.pages_failed, 1);
        assert_eq!(run.pages_fetched, 3);
        assert_eq!(run.items_created, 3);
        assert!(db.get_offer("acme", "A-3").await.unwrap().is_none());
    }

    // Test 6: Auth errors fail the run immediately
    #[tokio::test]
    async fn test_auth_error_fails_run() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut api = MockMarketplaceApi::new();
        api.expect_fetch_page().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ClassifiedError::new(ErrorKind::Auth, "invalid token").with_status(401))
        });
        let (pipeline, _db) = setup(api, pipeline_config()).await;

        let run = pipeline
            .sync_account(&account(), OperationType::Orders, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, SyncRunStatus::Failed);
        assert_eq!(run.error_kind, Some(ErrorKind::Auth));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // Test 7: Too many consecutive failed pages abandon the run
    #[tokio::test]
    async fn test_consecutive_page_failures() {
        let mut api = MockMarketplaceApi::new();
        api.expect_fetch_page()
            .times(3)
            .returning(|_| Err(ClassifiedError::new(ErrorKind::Business, "not found").with_status(404)));
        let (pipeline, _db) = setup(api, pipeline_config()).await;

        let run = pipeline
            .sync_account(&account(), OperationType::Offers, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, SyncRunStatus::Failed);
        assert_eq!(run.pages_failed, 3);
        assert_eq!(run.error_kind, Some(ErrorKind::Business));
    }

    // Test 8: Cancellation is observed at the top of the page loop
    #[tokio::test]
    async fn test_cancelled_run() {
        let mut api = MockMarketplaceApi::new();
        api.expect_fetch_page().never();
        let (pipeline, db) = setup(api, pipeline_config()).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = pipeline
            .sync_account(&account(), OperationType::Offers, cancel)
            .await
            .unwrap();

        assert_eq!(run.status, SyncRunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("Sync cancelled"));
        let stored = db.get_sync_run(&run.sync_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncRunStatus::Failed);
    }

    // Test 9: Malformed records count as failed items without aborting the page
    #[tokio::test]
    async fn test_malformed_record_counted() {
        let page = PageResponse {
            results: vec![json!({"id": "O-1", "status": "paid"}), json!("garbage")],
            is_error: Some(false),
            ..Default::default()
        };
        let (pipeline, db) = setup(paged_api(vec![page]), pipeline_config()).await;

        let run = pipeline
            .sync_account(&account(), OperationType::Orders, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, SyncRunStatus::Completed);
        assert_eq!(run.items_processed, 2);
        assert_eq!(run.items_created, 1);
        assert_eq!(run.items_failed, 1);
        assert!(db.get_order("acme", "O-1").await.unwrap().is_some());
    }

    // Test 10: hasMore and max pages stop the loop on full pages
    #[tokio::test]
    async fn test_has_more_and_max_pages() {
        let mut last = clean_page(&["A-1", "A-2"]);
        last.has_more = Some(false);
        let (pipeline, _db) = setup(paged_api(vec![last]), pipeline_config()).await;
        let run = pipeline
            .sync_account(&account(), OperationType::Offers, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.pages_fetched, 1);

        let pages = (0..10)
            .map(|i| {
                let a = format!("A-{}", 2 * i);
                let b = format!("A-{}", 2 * i + 1);
                clean_page(&[a.as_str(), b.as_str()])
            })
            .collect();
        let (pipeline, db) = setup(paged_api(pages), pipeline_config()).await;
        let mut limited = account();
        limited.max_pages = Some(3);
        let run = pipeline
            .sync_account(&limited, OperationType::Offers, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.pages_fetched, 3);
        assert_eq!(db.count_entities("acme", OperationType::Offers).await.unwrap(), 6);
    }
}
