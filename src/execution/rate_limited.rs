use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, TimeZone, Utc};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::order_queue::{OrderSaveQueue, SaveJob};
use crate::api::ExchangeClient;
use crate::error::{ExchangeError, TradingError, TradingResult};
use crate::models::{Order, OrderRequest};
use crate::persistence::OrderStore;

pub const RATE_LIMIT_RESET_HEADER: &str = "X-RateLimit-Reset";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "X-RateLimit-Remaining";

// Type alias for the rate limiter to simplify signatures
pub(crate) type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Build a token bucket with the given sustained rate and burst
pub(crate) fn token_bucket(requests_per_second: f64, burst: u32) -> DirectRateLimiter {
    let period = Duration::try_from_secs_f64(1.0 / requests_per_second)
        .unwrap_or(Duration::from_secs(1))
        .max(Duration::from_nanos(1));
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst);
    RateLimiter::direct(quota)
}

/// Executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub requests_per_second: f64,
    pub burst_size: u32,
    pub max_retries: u32,
    #[serde(rename = "initial_retry_delay_ms", with = "crate::config::duration_ms")]
    pub initial_retry_delay: Duration,
    #[serde(rename = "max_retry_delay_ms", with = "crate::config::duration_ms")]
    pub max_retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0,
            burst_size: 3,
            max_retries: 5,
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(format!(
                "requests_per_second must be positive, got {}",
                self.requests_per_second
            ));
        }
        if self.burst_size == 0 {
            return Err("burst_size must be at least 1".to_string());
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(format!(
                "initial_retry_delay ({:?}) exceeds max_retry_delay ({:?})",
                self.initial_retry_delay, self.max_retry_delay
            ));
        }
        Ok(())
    }
}

/// Rate limit window advertised by the exchange
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitState {
    pub reset_at: DateTime<Utc>,
    pub remaining: u32,
}

impl RateLimitState {
    /// Time left until the window resets, if callers must wait
    pub fn wait_time(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.remaining > 0 || now >= self.reset_at {
            return None;
        }
        (self.reset_at - now).to_std().ok()
    }
}

/// Order-management operations routed through the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOp {
    ExecuteOrder,
    CancelOrder,
    GetOrderStatus,
}

impl fmt::Display for OrderOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderOp::ExecuteOrder => "execute_order",
            OrderOp::CancelOrder => "cancel_order",
            OrderOp::GetOrderStatus => "get_order_status",
        };
        f.write_str(name)
    }
}

/// Exchange access facade: token bucket, reset-window awareness and
/// exponential backoff around every order-management call.
///
/// Share one instance (behind an `Arc`) between everything that talks to the
/// same exchange account so that they share one budget.
pub struct RateLimitedExecutor {
    client: Arc<dyn ExchangeClient>,
    config: ExecutorConfig,
    rate_limiter: DirectRateLimiter,
    rate_limit: RwLock<RateLimitState>,
    save_queue: Option<OrderSaveQueue>,
}

impl RateLimitedExecutor {
    pub fn new(client: Arc<dyn ExchangeClient>, config: ExecutorConfig) -> TradingResult<Self> {
        config.validate().map_err(TradingError::InvalidConfig)?;

        let rate_limiter = token_bucket(config.requests_per_second, config.burst_size);
        let rate_limit = RwLock::new(RateLimitState {
            reset_at: Utc::now(),
            remaining: config.burst_size,
        });

        Ok(Self {
            client,
            config,
            rate_limiter,
            rate_limit,
            save_queue: None,
        })
    }

    /// Persist placed and polled orders through a bounded worker pool.
    /// Must be called inside a tokio runtime.
    pub fn with_order_store(mut self, store: Arc<dyn OrderStore>) -> Self {
        self.save_queue = Some(OrderSaveQueue::spawn(store));
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn ExchangeClient> {
        &self.client
    }

    /// Snapshot of the current rate limit window
    pub async fn rate_limit_state(&self) -> RateLimitState {
        *self.rate_limit.read().await
    }

    /// Place an order
    pub async fn execute_order(
        &self,
        request: &OrderRequest,
        cancel: &CancellationToken,
    ) -> TradingResult<Order> {
        request
            .validate()
            .map_err(TradingError::InvalidOrderRequest)?;

        let order = self
            .run(OrderOp::ExecuteOrder, &request.symbol, cancel, || {
                self.client.place_order(request)
            })
            .await?;

        tracing::info!(
            order_id = %order.id,
            symbol = %order.symbol,
            side = order.side.as_str(),
            order_type = order.order_type.as_str(),
            quantity = order.quantity,
            "Order placed"
        );
        self.enqueue_save(SaveJob::Create(order.clone()));
        Ok(order)
    }

    /// Cancel an order
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        cancel: &CancellationToken,
    ) -> TradingResult<()> {
        self.run(OrderOp::CancelOrder, symbol, cancel, || {
            self.client.cancel_order(symbol, order_id)
        })
        .await?;

        tracing::info!(symbol = %symbol, order_id = %order_id, "Order canceled");
        Ok(())
    }

    /// Query an order
    pub async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
        cancel: &CancellationToken,
    ) -> TradingResult<Order> {
        let order = self
            .run(OrderOp::GetOrderStatus, symbol, cancel, || {
                self.client.get_order_status(symbol, order_id)
            })
            .await?;

        self.enqueue_save(SaveJob::Update(order.clone()));
        Ok(order)
    }

    /// Close the save queue and wait for pending saves
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.save_queue {
            queue.shutdown().await;
        }
    }

    fn enqueue_save(&self, job: SaveJob) {
        if let Some(queue) = &self.save_queue {
            queue.enqueue(job);
        }
    }

    /// Drive one operation through reset wait, token, call and retry
    async fn run<T, F, Fut>(
        &self,
        op: OrderOp,
        symbol: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> TradingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut backoff = self.new_backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            self.wait_for_rate_limit_reset(op, cancel).await?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TradingError::Canceled),
                _ = self.rate_limiter.until_ready() => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TradingError::Canceled),
                result = call() => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_rate_limit() {
                self.update_rate_limit_info(&err).await;
                tracing::warn!(
                    op = %op,
                    symbol = %symbol,
                    error = %err,
                    "Rate limited by exchange (attempt {}/{})",
                    attempt,
                    max_attempts
                );
            } else if err.is_retryable() {
                tracing::warn!(
                    op = %op,
                    symbol = %symbol,
                    error = %err,
                    "Retryable exchange error (attempt {}/{})",
                    attempt,
                    max_attempts
                );
            } else {
                tracing::error!(
                    op = %op,
                    symbol = %symbol,
                    error = %err,
                    "Non-retryable exchange error"
                );
                return Err(permanent_error(err));
            }

            if attempt >= max_attempts {
                tracing::error!(
                    op = %op,
                    symbol = %symbol,
                    attempts = attempt,
                    "Giving up after retries"
                );
                return Err(TradingError::RetriesExhausted {
                    attempts: attempt,
                    cause: err,
                });
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.max_retry_delay);
            tracing::debug!(op = %op, symbol = %symbol, delay_ms = delay.as_millis() as u64, "Backing off");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TradingError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.config.initial_retry_delay,
            initial_interval: self.config.initial_retry_delay,
            max_interval: self.config.max_retry_delay,
            // Caller cancellation bounds the total time instead
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    async fn wait_for_rate_limit_reset(
        &self,
        op: OrderOp,
        cancel: &CancellationToken,
    ) -> TradingResult<()> {
        let state = *self.rate_limit.read().await;
        let Some(wait) = state.wait_time(Utc::now()) else {
            return Ok(());
        };

        tracing::info!(
            op = %op,
            wait_ms = wait.as_millis() as u64,
            reset_at = %state.reset_at,
            "Waiting for rate limit reset"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TradingError::Canceled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    async fn update_rate_limit_info(&self, err: &ExchangeError) {
        let now = Utc::now();
        let fallback_reset = now
            + chrono::Duration::from_std(self.config.initial_retry_delay)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(500));

        let (reset_at, remaining) = if err.headers().is_some() {
            let reset_at = match err.header(RATE_LIMIT_RESET_HEADER) {
                Some(raw) => raw
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
                None => Some(fallback_reset),
            };
            let remaining = match err.header(RATE_LIMIT_REMAINING_HEADER) {
                Some(raw) => raw.trim().parse::<u32>().ok(),
                None => Some(0),
            };
            (reset_at, remaining)
        } else {
            (Some(fallback_reset), Some(0))
        };

        let mut state = self.rate_limit.write().await;
        // Unparseable header values leave the previous value in place
        if let Some(reset_at) = reset_at {
            state.reset_at = reset_at;
        }
        if let Some(remaining) = remaining {
            state.remaining = remaining;
        }

        tracing::info!(
            reset_at = %state.reset_at,
            remaining = state.remaining,
            "Updated rate limit information"
        );
    }
}

/// Map a non-retryable exchange error onto the trading taxonomy
fn permanent_error(err: ExchangeError) -> TradingError {
    match err {
        ExchangeError::OrderNotFound => TradingError::OrderNotFound(err.to_string()),
        ExchangeError::SymbolNotSupported(symbol) => TradingError::SymbolNotSupported(symbol),
        ExchangeError::InvalidOrderRequest(reason) => TradingError::InvalidOrderRequest(reason),
        cause => TradingError::Permanent { cause },
    }
}
