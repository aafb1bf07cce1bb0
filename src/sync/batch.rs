//! Bulk write processing
//!
//! Splits large write sets into contiguous batches and submits them one after
//! another. A failed batch is recorded and processing moves on, so one bad
//! batch never blocks the rest.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::gateway::ApiGateway;
use crate::config::BatchConfig;
use crate::models::{AccountCredentials, BatchRequest, BatchResult, WriteOperation};

/// Called after every batch with `(batch_index, total_batches)`, 1-based
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Split `items` into contiguous, order-preserving batches
///
/// A `batch_size` of 0 yields a single batch holding everything.
pub fn split_batches<T>(items: &[T], batch_size: usize) -> Vec<&[T]> {
    if items.is_empty() {
        return Vec::new();
    }
    if batch_size == 0 {
        return vec![items];
    }
    items.chunks(batch_size).collect()
}

/// Sequential batch executor
pub struct BatchProcessor {
    gateway: Arc<ApiGateway>,
    config: BatchConfig,
    cancel: Option<CancellationToken>,
}

impl BatchProcessor {
    /// Create a processor
    pub fn new(gateway: Arc<ApiGateway>, config: BatchConfig) -> Self {
        Self {
            gateway,
            config,
            cancel: None,
        }
    }

    /// Stop between batches once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Batch size used for a write operation
    pub fn batch_size_for(&self, operation: WriteOperation) -> usize {
        match operation {
            WriteOperation::PriceStockUpdate => self.config.price_stock_batch_size,
            WriteOperation::OfferUpdate | WriteOperation::OrderStatusUpdate => {
                self.config.default_batch_size
            }
        }
    }

    /// Delay between batches of a write operation, from its class rate
    pub fn pacing_for(&self, operation: WriteOperation) -> Duration {
        let rate = self.gateway.limiter().class_rate(operation.rate_class());
        if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::ZERO
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }

    async fn pause(&self, pacing: Duration) {
        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(pacing) => {}
                    _ = token.cancelled() => {}
                }
            }
            None => tokio::time::sleep(pacing).await,
        }
    }

    /// Run `operation` over every batch of `items`
    pub async fn process_batches<T, F, Fut, E>(
        &self,
        items: &[T],
        batch_size: usize,
        pacing: Duration,
        mut operation: F,
        progress: Option<ProgressCallback>,
    ) -> BatchResult
    where
        T: Clone,
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let batches = split_batches(items, batch_size);
        let total = batches.len();
        let mut result = BatchResult {
            total_items: items.len(),
            total_batches: total,
            ..Default::default()
        };

        for (idx, batch) in batches.into_iter().enumerate() {
            let index = idx + 1;
            if self.is_cancelled() {
                warn!(batch = index, total_batches = total, "Batch processing cancelled");
                result.cancelled = true;
                break;
            }

            match operation(batch.to_vec()).await {
                Ok(()) => {
                    result.successful_batches += 1;
                    debug!(batch = index, total_batches = total, size = batch.len(), "Batch succeeded");
                }
                Err(e) => {
                    result.failed_batches += 1;
                    result.errors.push(format!("batch {}: {}", index, e));
                    warn!(batch = index, total_batches = total, error = %e, "Batch failed");
                }
            }

            if let Some(callback) = &progress {
                callback(index, total);
            }

            if index < total && !pacing.is_zero() {
                self.pause(pacing).await;
            }
        }

        info!(
            total_items = result.total_items,
            total_batches = result.total_batches,
            successful = result.successful_batches,
            failed = result.failed_batches,
            cancelled = result.cancelled,
            "Batch processing finished"
        );
        result
    }

    /// Submit a write operation in batches through the gateway
    ///
    /// A batch whose response carries `isError == true` counts as failed
    /// whatever the HTTP status was.
    pub async fn submit(
        &self,
        credentials: &AccountCredentials,
        operation: WriteOperation,
        items: Vec<Value>,
        progress: Option<ProgressCallback>,
    ) -> BatchResult {
        let batch_size = self.batch_size_for(operation);
        let pacing = self.pacing_for(operation);

        self.process_batches(
            &items,
            batch_size,
            pacing,
            |batch| {
                let gateway = self.gateway.clone();
                let request = BatchRequest {
                    credentials: credentials.clone(),
                    operation,
                    items: batch,
                };
                async move {
                    let response = match gateway.submit_batch(&request).await {
                        Ok(response) => response,
                        Err(e) => return Err(e.to_string()),
                    };
                    if response.is_error == Some(true) {
                        let messages = response.joined_messages();
                        return Err(if messages.is_empty() {
                            "batch rejected".to_string()
                        } else {
                            messages
                        });
                    }
                    Ok::<(), String>(())
                }
            },
            progress,
        )
        .await
    }
}
