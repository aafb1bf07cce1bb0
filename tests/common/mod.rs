//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use marketplace_sync::config::{
    AccountConfig, ApiConfig, ClassLimitConfig, PipelineConfig, RateLimitsConfig, RetryConfig,
    ServerConfig,
};
use marketplace_sync::database::SqliteDatabase;
use marketplace_sync::error::ClassifiedError;
use marketplace_sync::models::{
    AccountCredentials, BatchRequest, BatchResponse, OperationType, PageRequest, PageResponse,
};
use marketplace_sync::server::{AppState, Server};
use marketplace_sync::sync::{
    AccountScheduler, AccountSyncer, ApiGateway, HttpMarketplaceClient, MarketplaceApi,
    RateLimiter, RetryPolicy, SchedulerConfig, SchedulerHandle,
};

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Limits loose enough that tests never wait on them
pub fn fast_rate_limits() -> RateLimitsConfig {
    RateLimitsConfig {
        orders: ClassLimitConfig::new(1000.0, 50, 100_000),
        other: ClassLimitConfig::new(1000.0, 50, 100_000),
        poll_interval_ms: 1,
        jitter_max_ms: 0,
    }
}

/// Retry policy with `max_retries` and no real backoff
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        max_retries,
        base_delay_secs: 0.01,
        max_delay_secs: 0.05,
        jitter: false,
        ..RetryConfig::default()
    })
}

/// API configuration pointing at a mock server
pub fn create_test_api_config(server: &MockServer) -> ApiConfig {
    ApiConfig {
        base_url: format!("{}/v1", server.uri()),
        request_timeout_secs: 5,
        default_retry_after_secs: 60.0,
        max_retry_after_secs: 0.05,
        acquire_timeout_secs: None,
    }
}

/// Gateway over the real HTTP client talking to `server`
pub fn create_test_gateway(server: &MockServer, max_retries: u32) -> Arc<ApiGateway> {
    let client = HttpMarketplaceClient::new(&create_test_api_config(server))
        .expect("Failed to create HTTP client");
    Arc::new(ApiGateway::new(
        Arc::new(client),
        Arc::new(RateLimiter::new(&fast_rate_limits())),
        fast_retry(max_retries),
        None,
    ))
}

/// Pipeline settings with two records per page and no page delay
pub fn create_test_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        items_per_page: 2,
        chunk_size: 2,
        page_delay_ms: 0,
        ..PipelineConfig::default()
    }
}

/// Offers-only account
pub fn create_test_account(id: &str) -> AccountConfig {
    AccountConfig::new(id, AccountCredentials::new(format!("key-{}", id)))
        .with_operations([OperationType::Offers])
}

/// Raw offer as the marketplace sends it
pub fn offer_json(id: &str) -> Value {
    json!({
        "id": id,
        "sku": format!("SKU-{}", id),
        "title": format!("Offer {}", id),
        "price": "19.90",
        "stock": 3
    })
}

/// Page body holding one offer per id
pub fn offers_page(ids: &[&str]) -> Value {
    offers_page_priced(ids, "19.90")
}

/// Page body whose offers all carry `price`
pub fn offers_page_priced(ids: &[&str], price: &str) -> Value {
    let results: Vec<Value> = ids
        .iter()
        .map(|id| {
            let mut offer = offer_json(id);
            offer["price"] = json!(price);
            offer
        })
        .collect();
    json!({
        "results": results,
        "isError": false,
        "messages": []
    })
}

/// Serve `body` for one page of `resource`
pub async fn mount_page(server: &MockServer, resource: &str, page: u32, body: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/v1/{}", resource)))
        .and(query_param("page", page.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// In-process API that answers every page with `results_per_page` offers and
/// records what it was sent
pub struct CountingApi {
    fetches: AtomicU32,
    batch_sizes: Mutex<Vec<usize>>,
    results_per_page: usize,
}

impl CountingApi {
    pub fn new(results_per_page: usize) -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicU32::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            results_per_page,
        })
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }
}

#[async_trait]
impl MarketplaceApi for CountingApi {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse, ClassifiedError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let results = (0..self.results_per_page)
            .map(|i| offer_json(&format!("P{}-{}", request.page, i)))
            .collect();
        Ok(PageResponse {
            results,
            is_error: Some(false),
            ..Default::default()
        })
    }

    async fn submit_batch(
        &self,
        request: &BatchRequest,
    ) -> Result<BatchResponse, ClassifiedError> {
        self.batch_sizes.lock().unwrap().push(request.items.len());
        Ok(BatchResponse::ok())
    }
}

/// Scheduler whose ticks never fire during a test
pub fn create_idle_scheduler(
    syncer: Arc<dyn AccountSyncer>,
    accounts: Vec<AccountConfig>,
) -> SchedulerHandle {
    let config = SchedulerConfig {
        tick_interval: Duration::from_secs(3600),
        initial_delay: Duration::from_secs(3600),
        run_timeout: Some(Duration::from_secs(30)),
    };
    AccountScheduler::new(config, syncer, accounts).start()
}

/// Create test server configuration
pub fn create_test_server_config() -> ServerConfig {
    ServerConfig {
        enabled: true,
        host: "127.0.0.1".to_string(),
        port: 0,
    }
}

/// Create application state around a database and scheduler
pub fn create_test_state(
    database: Arc<SqliteDatabase>,
    scheduler: SchedulerHandle,
) -> AppState<SqliteDatabase> {
    AppState {
        database,
        scheduler,
        rate_limiter: Arc::new(RateLimiter::new(&fast_rate_limits())),
    }
}

/// Run a test server on a random port
///
/// Returns the bound address and a sender that shuts the server down.
pub async fn run_test_server(
    state: AppState<SqliteDatabase>,
) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = Server::new(create_test_server_config(), state);

    tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = server.serve(listener, shutdown).await {
            eprintln!("Test server failed: {}", e);
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;

    (addr, shutdown_tx)
}
