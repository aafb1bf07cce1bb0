//! Outbound rate limiter for marketplace API calls
//!
//! Every call passes two gates for its operation class: a token bucket that
//! enforces the per-second rate and a 60 second sliding window that enforces
//! the per-minute quota. Classes never share state, so a burst of offer
//! traffic cannot starve order calls.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{ClassLimitConfig, RateLimitsConfig};
use crate::error::RateLimitError;

/// Length of the sliding window
pub const WINDOW_SIZE: Duration = Duration::from_secs(60);

/// Floor for a single bucket poll, so float rounding cannot spin the loop
const MIN_POLL: Duration = Duration::from_millis(1);

/// Rate limit class of a marketplace operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Order reads and writes
    Orders,
    /// Everything else
    Other,
}

impl OperationClass {
    /// All classes, in display order
    pub const ALL: [OperationClass; 2] = [OperationClass::Orders, OperationClass::Other];

    /// Class name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Orders => "orders",
            OperationClass::Other => "other",
        }
    }
}

impl std::fmt::Display for OperationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token bucket with continuous refill
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_rate,
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `cost` tokens, or return how long until they would be available
    fn try_consume(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            let deficit = (cost - self.tokens) / self.refill_rate;
            Err(Duration::from_secs_f64(deficit.max(0.0)))
        }
    }

    /// Return tokens taken by a request that was never sent
    fn refund(&mut self, cost: f64, now: Instant) {
        self.refill(now);
        self.tokens = (self.tokens + cost).min(self.capacity);
    }

    fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}

/// Request timestamps within the last [`WINDOW_SIZE`]
#[derive(Debug)]
struct SlidingWindow {
    limit: u32,
    window: Duration,
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            timestamps: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Wait until `cost` more entries fit in the window
    fn time_until_free(&mut self, cost: u32, now: Instant) -> Duration {
        self.prune(now);
        let len = self.timestamps.len();
        let cost = cost as usize;
        let limit = self.limit as usize;
        if len + cost <= limit {
            return Duration::ZERO;
        }

        // The entry whose expiry makes room for the whole request
        let idx = len + cost - limit - 1;
        match self.timestamps.get(idx) {
            Some(ts) => (*ts + self.window).saturating_duration_since(now),
            None => self.window,
        }
    }

    fn record(&mut self, cost: u32, now: Instant) {
        for _ in 0..cost {
            self.timestamps.push_back(now);
        }
    }

    fn count(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.timestamps.len() as u32
    }
}

/// Both gates for one class
#[derive(Debug)]
struct ClassLimiter {
    class: OperationClass,
    config: ClassLimitConfig,
    bucket: Mutex<TokenBucket>,
    window: Mutex<SlidingWindow>,
}

impl ClassLimiter {
    fn new(class: OperationClass, config: ClassLimitConfig) -> Self {
        Self {
            class,
            bucket: Mutex::new(TokenBucket::new(
                config.burst_capacity,
                config.requests_per_second,
            )),
            window: Mutex::new(SlidingWindow::new(config.requests_per_minute, WINDOW_SIZE)),
            config,
        }
    }
}

/// Process-wide limiter counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStats {
    /// Successful acquires per class
    pub requests_by_class: BTreeMap<OperationClass, u64>,
    /// Acquires that had to wait on the bucket or the window
    pub rate_limit_hits: u64,
    /// Total time spent inside `acquire`, in milliseconds
    pub total_wait_ms: u64,
}

/// Point-in-time usage of one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub class: OperationClass,
    pub requests_in_window: u32,
    pub requests_per_minute: u32,
    pub usage_percent: f64,
    pub tokens_available: f64,
    pub burst_capacity: u32,
    pub requests_per_second: f64,
}

/// Rate limiter shared by every outbound marketplace call
#[derive(Debug)]
pub struct RateLimiter {
    orders: ClassLimiter,
    other: ClassLimiter,
    poll_interval: Duration,
    jitter_max: Duration,
    stats: Mutex<RateLimitStats>,
}

impl RateLimiter {
    /// Create a limiter from configuration
    pub fn new(config: &RateLimitsConfig) -> Self {
        Self {
            orders: ClassLimiter::new(OperationClass::Orders, config.orders.clone()),
            other: ClassLimiter::new(OperationClass::Other, config.other.clone()),
            poll_interval: Duration::from_millis(config.poll_interval_ms).max(MIN_POLL),
            jitter_max: Duration::from_millis(config.jitter_max_ms),
            stats: Mutex::new(RateLimitStats::default()),
        }
    }

    /// Create a limiter with default limits
    pub fn with_defaults() -> Self {
        Self::new(&RateLimitsConfig::default())
    }

    fn limiter(&self, class: OperationClass) -> &ClassLimiter {
        match class {
            OperationClass::Orders => &self.orders,
            OperationClass::Other => &self.other,
        }
    }

    /// Configured requests per second for a class
    pub fn class_rate(&self, class: OperationClass) -> f64 {
        self.limiter(class).config.requests_per_second
    }

    /// Wait until `cost` requests of `class` may be sent
    ///
    /// Returns the time spent waiting. `timeout = None` waits as long as it
    /// takes. The sliding window is re-checked when the request is recorded,
    /// so concurrent callers can never push it past its limit.
    pub async fn acquire(
        &self,
        class: OperationClass,
        cost: u32,
        timeout: Option<Duration>,
    ) -> Result<Duration, RateLimitError> {
        let limiter = self.limiter(class);
        let capacity = limiter
            .config
            .burst_capacity
            .min(limiter.config.requests_per_minute);
        if cost > capacity {
            return Err(RateLimitError::CostExceedsCapacity {
                class: class.to_string(),
                cost,
                capacity,
            });
        }
        if cost == 0 {
            return Ok(Duration::ZERO);
        }

        let start = Instant::now();
        let deadline = timeout.map(|t| start + t);
        let mut throttled = false;

        // Window pre-check
        let wait = limiter
            .window
            .lock()
            .await
            .time_until_free(cost, Instant::now());
        if !wait.is_zero() {
            throttled = true;
            self.wait_for_window(class, wait, deadline).await?;
        }

        // Token bucket
        loop {
            let now = Instant::now();
            let shortfall = limiter.bucket.lock().await.try_consume(cost as f64, now);
            let deficit = match shortfall {
                Ok(()) => break,
                Err(deficit) => deficit,
            };
            throttled = true;

            let mut pause = deficit.min(self.poll_interval).max(MIN_POLL);
            if let Some(deadline) = deadline {
                if now >= deadline {
                    warn!(class = %class, cost = cost, "Timed out waiting for rate limit tokens");
                    return Err(RateLimitError::Timeout {
                        class: class.to_string(),
                        waited_ms: start.elapsed().as_millis() as u64,
                    });
                }
                pause = pause.min(deadline - now);
            }
            tokio::time::sleep(pause).await;
        }

        let jitter = self.jitter();
        if !jitter.is_zero() {
            tokio::time::sleep(jitter).await;
        }

        // Record under the window lock
        loop {
            let now = Instant::now();
            let wait = {
                let mut window = limiter.window.lock().await;
                let wait = window.time_until_free(cost, now);
                if wait.is_zero() {
                    window.record(cost, now);
                }
                wait
            };
            if wait.is_zero() {
                break;
            }
            throttled = true;
            if let Err(e) = self.wait_for_window(class, wait, deadline).await {
                limiter
                    .bucket
                    .lock()
                    .await
                    .refund(cost as f64, Instant::now());
                return Err(e);
            }
        }

        let waited = start.elapsed();
        {
            let mut stats = self.stats.lock().await;
            *stats.requests_by_class.entry(class).or_insert(0) += 1;
            if throttled {
                stats.rate_limit_hits += 1;
            }
            stats.total_wait_ms += waited.as_millis() as u64;
        }

        debug!(
            class = %class,
            cost = cost,
            waited_ms = waited.as_millis() as u64,
            throttled = throttled,
            "Rate limit slot acquired"
        );
        Ok(waited)
    }

    async fn wait_for_window(
        &self,
        class: OperationClass,
        wait: Duration,
        deadline: Option<Instant>,
    ) -> Result<(), RateLimitError> {
        if let Some(deadline) = deadline {
            if Instant::now() + wait > deadline {
                warn!(
                    class = %class,
                    remaining_secs = wait.as_secs_f64(),
                    "Rate limit window exhausted"
                );
                return Err(RateLimitError::WindowExhausted {
                    class: class.to_string(),
                    remaining_secs: wait.as_secs_f64(),
                });
            }
        }
        debug!(class = %class, wait_ms = wait.as_millis() as u64, "Waiting for rate limit window");
        tokio::time::sleep(wait).await;
        Ok(())
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Current usage of one class
    pub async fn usage(&self, class: OperationClass) -> UsageSnapshot {
        let limiter = self.limiter(class);
        let now = Instant::now();
        let requests_in_window = limiter.window.lock().await.count(now);
        let tokens_available = limiter.bucket.lock().await.available(now);
        let rpm = limiter.config.requests_per_minute;

        UsageSnapshot {
            class,
            requests_in_window,
            requests_per_minute: rpm,
            usage_percent: if rpm == 0 {
                0.0
            } else {
                requests_in_window as f64 / rpm as f64 * 100.0
            },
            tokens_available,
            burst_capacity: limiter.config.burst_capacity,
            requests_per_second: limiter.config.requests_per_second,
        }
    }

    /// Usage of every class
    pub async fn usage_all(&self) -> Vec<UsageSnapshot> {
        let mut snapshots = Vec::with_capacity(OperationClass::ALL.len());
        for class in OperationClass::ALL {
            snapshots.push(self.usage(class).await);
        }
        snapshots
    }

    /// Copy of the counters
    pub async fn stats(&self) -> RateLimitStats {
        self.stats.lock().await.clone()
    }

    /// Zero the counters
    pub async fn reset_stats(&self) {
        *self.stats.lock().await = RateLimitStats::default();
    }
}
