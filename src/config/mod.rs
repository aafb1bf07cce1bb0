//! Configuration management for marketplace-sync
//!
//! This module handles loading, parsing, and validating application configuration
//! from YAML files and environment variables.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use crate::error::ErrorKind;
use crate::models::{AccountCredentials, OperationType};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Marketplace API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Rate limits per operation class
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    /// Retry policy for marketplace calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Bulk write configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Paginated ingestion configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: ScheduleConfig,

    /// Seller accounts to synchronize
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::FileRead(format!("Failed to read config file: {}", e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // First, expand environment variables in the YAML string
        let expanded = expand_env_vars(yaml);
        serde_yaml::from_str(&expanded)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Load configuration from environment variables with prefix MARKETPLACE_SYNC_
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // Server config from env
        if let Ok(host) = std::env::var("MARKETPLACE_SYNC_SERVER_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("MARKETPLACE_SYNC_SERVER_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Parse("Invalid port number".to_string()))?;
        }

        // Database config from env
        if let Ok(path) = std::env::var("MARKETPLACE_SYNC_DATABASE_PATH") {
            config.database.path = path;
        }

        // Logging config from env
        if let Ok(level) = std::env::var("MARKETPLACE_SYNC_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("MARKETPLACE_SYNC_LOG_FORMAT") {
            config.logging.format = format;
        }

        // API config from env
        if let Ok(base_url) = std::env::var("MARKETPLACE_SYNC_API_BASE_URL") {
            config.api.base_url = base_url;
        }

        // A single account can be configured without a file
        if let (Ok(id), Ok(api_key)) = (
            std::env::var("MARKETPLACE_SYNC_ACCOUNT_ID"),
            std::env::var("MARKETPLACE_SYNC_API_KEY"),
        ) {
            let mut account = AccountConfig::new(id, AccountCredentials::new(api_key));
            if let Ok(seller_id) = std::env::var("MARKETPLACE_SYNC_SELLER_ID") {
                account.credentials.seller_id = Some(seller_id);
            }
            if let Ok(interval) = std::env::var("MARKETPLACE_SYNC_INTERVAL_SECS") {
                account.interval_secs = interval
                    .parse()
                    .map_err(|_| ConfigError::Parse("Invalid sync interval".to_string()))?;
            }
            config.accounts.push(account);
        }

        Ok(config)
    }

    /// Check values the engine cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, limits) in [
            ("orders", &self.rate_limits.orders),
            ("other", &self.rate_limits.other),
        ] {
            if !(limits.requests_per_second > 0.0) {
                return Err(ConfigError::InvalidValue(format!(
                    "rate_limits.{}.requests_per_second must be positive",
                    name
                )));
            }
            if limits.burst_capacity == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "rate_limits.{}.burst_capacity must be at least 1",
                    name
                )));
            }
            if limits.requests_per_minute == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "rate_limits.{}.requests_per_minute must be at least 1",
                    name
                )));
            }
        }

        for (name, secs) in [
            ("api.default_retry_after_secs", self.api.default_retry_after_secs),
            ("api.max_retry_after_secs", self.api.max_retry_after_secs),
        ] {
            if !(secs.is_finite() && secs >= 0.0) {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be a non-negative number",
                    name
                )));
            }
        }

        if self.pipeline.items_per_page == 0 {
            return Err(ConfigError::InvalidValue(
                "pipeline.items_per_page must be at least 1".to_string(),
            ));
        }
        if self.pipeline.max_pages == 0 {
            return Err(ConfigError::InvalidValue(
                "pipeline.max_pages must be at least 1".to_string(),
            ));
        }
        if self.batch.default_batch_size == 0 || self.batch.price_stock_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "batch sizes must be at least 1".to_string(),
            ));
        }
        if self.scheduler.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "scheduler.tick_interval_secs must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.id.is_empty() {
                return Err(ConfigError::MissingRequired("accounts[].id".to_string()));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "duplicate account id: {}",
                    account.id
                )));
            }
            if account.interval_secs == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "account {}: interval_secs must be at least 1",
                    account.id
                )));
            }
            if account.operation_types.is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "account {}: operation_types must not be empty",
                    account.id
                )));
            }
            if account.credentials.api_key.is_empty() {
                return Err(ConfigError::MissingRequired(format!(
                    "account {}: credentials.api_key",
                    account.id
                )));
            }
        }

        Ok(())
    }

    /// Accounts with `enabled: true`
    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Whether the observability server is started
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,

    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_server_enabled() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "/data/db/marketplace-sync.db".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format ("json" or "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Marketplace API configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    /// Base URL all resource paths are joined to
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request deadline in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Delay used for HTTP 429 responses without a retry hint
    #[serde(default = "default_retry_after")]
    pub default_retry_after_secs: f64,

    /// Upper bound applied to server retry hints
    #[serde(default = "default_max_retry_after")]
    pub max_retry_after_secs: f64,

    /// Longest wait for a rate limiter slot; unset waits forever
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            default_retry_after_secs: default_retry_after(),
            max_retry_after_secs: default_max_retry_after(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.marketplace.example/v1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_retry_after() -> f64 {
    60.0
}

fn default_max_retry_after() -> f64 {
    300.0
}

fn default_acquire_timeout() -> Option<u64> {
    Some(120)
}

/// Limits for one operation class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassLimitConfig {
    /// Token refill rate
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Token bucket capacity
    #[serde(default = "default_burst_capacity")]
    pub burst_capacity: u32,

    /// Sliding window cap over 60 seconds
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

impl ClassLimitConfig {
    /// Create limits for one class
    pub fn new(requests_per_second: f64, burst_capacity: u32, requests_per_minute: u32) -> Self {
        Self {
            requests_per_second,
            burst_capacity,
            requests_per_minute,
        }
    }
}

impl Default for ClassLimitConfig {
    fn default() -> Self {
        Self::new(
            default_requests_per_second(),
            default_burst_capacity(),
            default_requests_per_minute(),
        )
    }
}

fn default_requests_per_second() -> f64 {
    1.0
}

fn default_burst_capacity() -> u32 {
    1
}

fn default_requests_per_minute() -> u32 {
    60
}

/// Rate limits for all operation classes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitsConfig {
    /// Limits for order operations
    #[serde(default = "default_orders_limits")]
    pub orders: ClassLimitConfig,

    /// Limits for every other operation
    #[serde(default = "default_other_limits")]
    pub other: ClassLimitConfig,

    /// Token bucket polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound of the random delay added after each acquire
    #[serde(default = "default_jitter_max")]
    pub jitter_max_ms: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            orders: default_orders_limits(),
            other: default_other_limits(),
            poll_interval_ms: default_poll_interval(),
            jitter_max_ms: default_jitter_max(),
        }
    }
}

fn default_orders_limits() -> ClassLimitConfig {
    ClassLimitConfig::new(1.0, 1, 60)
}

fn default_other_limits() -> ClassLimitConfig {
    ClassLimitConfig::new(3.0, 1, 180)
}

fn default_poll_interval() -> u64 {
    100
}

fn default_jitter_max() -> u64 {
    100
}

/// Retry configuration for marketplace calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before the first retry, in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: f64,

    /// Maximum backoff, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to add up to 10% jitter to computed backoffs
    #[serde(default = "default_jitter")]
    pub jitter: bool,

    /// Error kinds that are retried
    #[serde(default = "default_retryable_kinds")]
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            retryable_kinds: default_retryable_kinds(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> f64 {
    2.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_retryable_kinds() -> Vec<ErrorKind> {
    vec![ErrorKind::RateLimit, ErrorKind::Network, ErrorKind::Timeout]
}

/// Bulk write configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Items per batch for full updates
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,

    /// Items per batch for price and stock updates
    #[serde(default = "default_price_stock_batch_size")]
    pub price_stock_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_batch_size: default_batch_size(),
            price_stock_batch_size: default_price_stock_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_price_stock_batch_size() -> usize {
    25
}

/// Paginated ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Records requested per page
    #[serde(default = "default_items_per_page")]
    pub items_per_page: u32,

    /// Hard cap on pages per run
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Records per upsert transaction; 0 stores each page in one transaction
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Courtesy delay between page fetches in milliseconds
    #[serde(default = "default_page_delay")]
    pub page_delay_ms: u64,

    /// Consecutive failed pages after which the run is abandoned
    #[serde(default = "default_max_consecutive_page_failures")]
    pub max_consecutive_page_failures: u32,

    /// Message codes that mark an error response as advisory
    #[serde(default)]
    pub advisory_codes: Vec<String>,

    /// Keywords that mark an error message as advisory when no code matches
    #[serde(default = "default_advisory_keywords")]
    pub advisory_keywords: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            items_per_page: default_items_per_page(),
            max_pages: default_max_pages(),
            chunk_size: default_chunk_size(),
            page_delay_ms: default_page_delay(),
            max_consecutive_page_failures: default_max_consecutive_page_failures(),
            advisory_codes: Vec::new(),
            advisory_keywords: default_advisory_keywords(),
        }
    }
}

fn default_items_per_page() -> u32 {
    50
}

fn default_max_pages() -> u32 {
    100
}

fn default_chunk_size() -> usize {
    25
}

fn default_page_delay() -> u64 {
    250
}

fn default_max_consecutive_page_failures() -> u32 {
    3
}

fn default_advisory_keywords() -> Vec<String> {
    vec!["documentation".to_string(), "metadata".to_string()]
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Seconds between checks for due accounts
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Delay before the first check, in seconds
    #[serde(default)]
    pub initial_delay_secs: u64,

    /// Longest a single account cycle may run before it is cancelled
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            initial_delay_secs: 0,
            run_timeout_secs: default_run_timeout(),
        }
    }
}

fn default_tick_interval() -> u64 {
    60
}

fn default_run_timeout() -> Option<u64> {
    Some(1800)
}

/// One seller account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountConfig {
    /// Unique account identifier
    pub id: String,

    /// Whether the scheduler picks this account up
    #[serde(default = "default_account_enabled")]
    pub enabled: bool,

    /// Seconds between the end of a cycle and the next one
    #[serde(default = "default_account_interval")]
    pub interval_secs: u64,

    /// Operations synchronized every cycle
    #[serde(default = "default_operation_types")]
    pub operation_types: BTreeSet<OperationType>,

    /// API credentials
    #[serde(default)]
    pub credentials: AccountCredentials,

    /// Extra query parameters sent with every page request
    #[serde(default)]
    pub filters: BTreeMap<String, String>,

    /// Overrides `pipeline.max_pages`
    #[serde(default)]
    pub max_pages: Option<u32>,

    /// Overrides `pipeline.items_per_page`
    #[serde(default)]
    pub items_per_page: Option<u32>,
}

impl AccountConfig {
    /// Create an account with default cadence and operations
    pub fn new(id: impl Into<String>, credentials: AccountCredentials) -> Self {
        Self {
            id: id.into(),
            enabled: default_account_enabled(),
            interval_secs: default_account_interval(),
            operation_types: default_operation_types(),
            credentials,
            filters: BTreeMap::new(),
            max_pages: None,
            items_per_page: None,
        }
    }

    /// Set the interval
    pub fn with_interval(mut self, interval_secs: u64) -> Self {
        self.interval_secs = interval_secs;
        self
    }

    /// Set the synchronized operations
    pub fn with_operations(mut self, operations: impl IntoIterator<Item = OperationType>) -> Self {
        self.operation_types = operations.into_iter().collect();
        self
    }
}

fn default_account_enabled() -> bool {
    true
}

fn default_account_interval() -> u64 {
    1800
}

fn default_operation_types() -> BTreeSet<OperationType> {
    BTreeSet::from([OperationType::Offers, OperationType::Orders])
}

/// Configuration error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read configuration file: {0}")]
    FileRead(String),

    /// Error parsing configuration
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Expand environment variables in a string
///
/// Supports `${VAR_NAME}` syntax
fn expand_env_vars(input: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return input.to_string(),
    };

    re.replace_all(input, |caps: &regex_lite::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
