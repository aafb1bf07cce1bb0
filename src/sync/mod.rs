//! Rate-limited synchronization engine
//!
//! This module provides everything between the scheduler and the marketplace
//! API: rate limiting, error classification, retries, batching and the
//! paginated ingestion pipeline.
//!
//! # Components
//!
//! - [`rate_limiter`]: Token bucket plus sliding window per operation class
//! - [`classify`]: Maps HTTP and transport failures to error kinds
//! - [`retry`]: Retry policy with exponential backoff for transient failures
//! - [`gateway`]: Marketplace transport seam, wrapped with limiter and retries
//! - [`http_client`]: reqwest implementation of the transport
//! - [`batch`]: Chunked bulk writes
//! - [`validation`] and [`mapping`]: Page checks and record coercion
//! - [`pipeline`]: Paginated fetch and idempotent upsert for one account
//! - [`scheduler`]: Per-account periodic and manual sync
//!
//! # Example
//!
//! ```ignore
//! use marketplace_sync::sync::{ApiGateway, HttpMarketplaceClient, RateLimiter, RetryPolicy};
//! use marketplace_sync::config::Config;
//!
//! let config = Config::default();
//! let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
//! let client = Arc::new(HttpMarketplaceClient::new(&config.api)?);
//! let gateway = ApiGateway::new(client, limiter, RetryPolicy::new(config.retry.clone()), None);
//!
//! let page = gateway.fetch_page(&request).await?;
//! ```

pub mod batch;
pub mod classify;
pub mod gateway;
pub mod http_client;
pub mod mapping;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry;
pub mod scheduler;
pub mod validation;

// Re-export main types for convenience
pub use batch::{split_batches, BatchProcessor, ProgressCallback};
pub use classify::ErrorClassifier;
pub use gateway::{ApiGateway, MarketplaceApi};
pub use http_client::HttpMarketplaceClient;
pub use pipeline::{AccountSyncer, SyncPipeline};
pub use rate_limiter::{OperationClass, RateLimitStats, RateLimiter, UsageSnapshot};
pub use retry::RetryPolicy;
pub use scheduler::{AccountScheduler, SchedulerConfig, SchedulerHandle};
pub use validation::{PageVerdict, ResponseValidator};
