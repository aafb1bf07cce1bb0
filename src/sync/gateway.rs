//! Rate-limited, retried access to the marketplace API
//!
//! [`MarketplaceApi`] is the transport seam. [`ApiGateway`] wraps any
//! implementation so that every attempt, retries included, first takes a slot
//! from the shared [`RateLimiter`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::rate_limiter::RateLimiter;
use super::retry::RetryPolicy;
use crate::error::ClassifiedError;
use crate::models::{BatchRequest, BatchResponse, PageRequest, PageResponse};

/// Marketplace API transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// Fetch one page of a listing
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse, ClassifiedError>;

    /// Submit one batch write
    async fn submit_batch(&self, request: &BatchRequest)
        -> Result<BatchResponse, ClassifiedError>;
}

/// Marketplace access through the rate limiter and the retry policy
pub struct ApiGateway {
    api: Arc<dyn MarketplaceApi>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    acquire_timeout: Option<Duration>,
}

impl ApiGateway {
    /// Create a gateway
    pub fn new(
        api: Arc<dyn MarketplaceApi>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        Self {
            api,
            limiter,
            retry,
            acquire_timeout,
        }
    }

    /// Shared rate limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetch one page, rate limited and retried
    pub async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse, ClassifiedError> {
        let class = request.operation.rate_class();
        self.retry
            .execute(|| async move {
                self.limiter.acquire(class, 1, self.acquire_timeout).await?;
                debug!(
                    operation = %request.operation,
                    page = request.page,
                    "Fetching page"
                );
                self.api.fetch_page(request).await
            })
            .await
    }

    /// Submit one batch, rate limited and retried
    pub async fn submit_batch(
        &self,
        request: &BatchRequest,
    ) -> Result<BatchResponse, ClassifiedError> {
        let class = request.operation.rate_class();
        self.retry
            .execute(|| async move {
                self.limiter.acquire(class, 1, self.acquire_timeout).await?;
                debug!(
                    operation = %request.operation,
                    items = request.items.len(),
                    "Submitting batch"
                );
                self.api.submit_batch(request).await
            })
            .await
    }
}
