use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::cache::{SniperCaches, CACHE_PURGE_INTERVAL};
use super::config::{SniperConfig, SNIPER_LIMITER_BURST};
use super::post_trade::PostTradeScheduler;
use crate::api::MarketData;
use crate::error::{TradingError, TradingResult};
use crate::execution::rate_limited::{token_bucket, DirectRateLimiter};
use crate::execution::{cancellable, cancellable_sleep, RateLimitedExecutor};
use crate::models::{Order, OrderRequest, OrderSide};
use crate::persistence::PositionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SniperStatus {
    Running,
    Stopped,
}

struct EngineState {
    status: SniperStatus,
    config: SniperConfig,
    semaphore: Arc<Semaphore>,
    rate_limiter: Arc<DirectRateLimiter>,
}

struct CacheCleaner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner {
    executor: Arc<RateLimitedExecutor>,
    market: Arc<dyn MarketData>,
    post_trade: Arc<PostTradeScheduler>,
    state: RwLock<EngineState>,
    caches: Arc<SniperCaches>,
    in_flight: AtomicUsize,
    cleaner: Mutex<Option<CacheCleaner>>,
    post_trade_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Releases the in-flight slot when a snipe finishes, fails or is dropped
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Buys newly listed tokens: validate, price, size, place, then schedule exits.
///
/// Cloning is cheap; all clones drive the same engine.
#[derive(Clone)]
pub struct SniperEngine {
    inner: Arc<EngineInner>,
}

impl SniperEngine {
    pub fn new(
        executor: Arc<RateLimitedExecutor>,
        market: Arc<dyn MarketData>,
        config: SniperConfig,
    ) -> TradingResult<Self> {
        Self::build(executor, market, None, config)
    }

    /// Engine that records filled entries as positions for the monitor
    pub fn with_position_store(
        executor: Arc<RateLimitedExecutor>,
        market: Arc<dyn MarketData>,
        positions: Arc<dyn PositionStore>,
        config: SniperConfig,
    ) -> TradingResult<Self> {
        Self::build(executor, market, Some(positions), config)
    }

    fn build(
        executor: Arc<RateLimitedExecutor>,
        market: Arc<dyn MarketData>,
        positions: Option<Arc<dyn PositionStore>>,
        config: SniperConfig,
    ) -> TradingResult<Self> {
        let post_trade = PostTradeScheduler::new(Arc::clone(&executor), positions);
        Self::from_parts(executor, market, post_trade, config)
    }

    /// Engine with a custom post-trade scheduler
    pub fn from_parts(
        executor: Arc<RateLimitedExecutor>,
        market: Arc<dyn MarketData>,
        post_trade: PostTradeScheduler,
        config: SniperConfig,
    ) -> TradingResult<Self> {
        config.validate().map_err(TradingError::InvalidConfig)?;

        let state = EngineState {
            status: SniperStatus::Stopped,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_orders)),
            rate_limiter: Arc::new(token_bucket(config.rate_limit_per_sec, SNIPER_LIMITER_BURST)),
            config,
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                executor,
                market,
                post_trade: Arc::new(post_trade),
                state: RwLock::new(state),
                caches: Arc::new(SniperCaches::new()),
                in_flight: AtomicUsize::new(0),
                cleaner: Mutex::new(None),
                post_trade_tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    pub async fn status(&self) -> SniperStatus {
        self.inner.state.read().await.status
    }

    /// Number of snipes currently past admission
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub async fn get_config(&self) -> SniperConfig {
        self.inner.state.read().await.config.clone()
    }

    /// Replace the configuration. Snipes already running keep their snapshot.
    pub async fn update_config(&self, config: SniperConfig) -> TradingResult<()> {
        config.validate().map_err(TradingError::InvalidConfig)?;

        let mut state = self.inner.state.write().await;
        if config.max_concurrent_orders != state.config.max_concurrent_orders {
            state.semaphore = Arc::new(Semaphore::new(config.max_concurrent_orders));
        }
        if config.rate_limit_per_sec != state.config.rate_limit_per_sec {
            state.rate_limiter = Arc::new(token_bucket(config.rate_limit_per_sec, SNIPER_LIMITER_BURST));
        }
        state.config = config;

        tracing::info!(
            max_concurrent_orders = state.config.max_concurrent_orders,
            max_buy_amount = state.config.max_buy_amount,
            max_price_per_token = state.config.max_price_per_token,
            "Sniper configuration updated"
        );
        Ok(())
    }

    /// Start accepting snipes. No-op when already running.
    pub async fn start(&self) {
        {
            let mut state = self.inner.state.write().await;
            if state.status == SniperStatus::Running {
                return;
            }
            self.inner.caches.clear();
            state.status = SniperStatus::Running;
        }

        let mut cleaner = self.inner.cleaner.lock().await;
        if cleaner.is_none() {
            *cleaner = Some(spawn_cache_cleaner(Arc::clone(&self.inner.caches)));
        }
        tracing::info!("Sniper service started");
    }

    /// Stop accepting snipes. In-flight snipes and post-trade tasks finish
    /// on their own. No-op when already stopped.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.write().await;
            if state.status == SniperStatus::Stopped {
                return;
            }
            state.status = SniperStatus::Stopped;
        }

        let cleaner = self.inner.cleaner.lock().await.take();
        if let Some(CacheCleaner { cancel, handle }) = cleaner {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!("Cache cleaner task panicked: {}", e);
            }
        }
        tracing::info!("Sniper service stopped");
    }

    /// Snipe with the current configuration
    pub async fn execute_snipe(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> TradingResult<Order> {
        let config = self.get_config().await;
        self.execute_snipe_with_config(symbol, config, cancel).await
    }

    /// Snipe with a caller-supplied configuration
    pub async fn execute_snipe_with_config(
        &self,
        symbol: &str,
        config: SniperConfig,
        cancel: &CancellationToken,
    ) -> TradingResult<Order> {
        config.validate().map_err(TradingError::InvalidConfig)?;

        let (semaphore, rate_limiter) = {
            let state = self.inner.state.read().await;
            if state.status != SniperStatus::Running {
                return Err(TradingError::NotRunning);
            }
            (Arc::clone(&state.semaphore), Arc::clone(&state.rate_limiter))
        };

        // Admission: check and reserve in one step so the gate is never overrun
        let limit = config.max_concurrent_orders;
        self.inner
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .map_err(|_| {
                tracing::warn!(symbol = %symbol, limit, "Concurrency limit reached");
                TradingError::ConcurrencyLimit { limit }
            })?;
        let _in_flight = InFlightGuard(&self.inner.in_flight);

        let _permit = cancellable(cancel, semaphore.acquire_owned())
            .await?
            .map_err(|_| TradingError::NotRunning)?;

        if !self.fast_validate_symbol(symbol, cancel).await? {
            return Err(TradingError::InvalidSymbol(symbol.to_string()));
        }

        let price = self.get_fast_price(symbol, &config, cancel).await?;
        if !price.is_finite() || price <= 0.0 {
            return Err(TradingError::InsufficientLiquidity(symbol.to_string()));
        }
        if price > config.max_price_per_token {
            tracing::warn!(
                symbol = %symbol,
                price,
                max_price = config.max_price_per_token,
                "Price exceeds maximum allowed price"
            );
            return Err(TradingError::MaxPriceExceeded {
                price,
                max: config.max_price_per_token,
            });
        }

        let quantity = config.max_buy_amount / price;
        // Market orders carry the quoted price for the record; the exchange ignores it
        let request = OrderRequest {
            order_type: config.preferred_order_type,
            price,
            ..OrderRequest::market(symbol, OrderSide::Buy, quantity)
        };

        let order = self
            .place_with_retries(&request, &config, &rate_limiter, cancel)
            .await?;

        tracing::info!(
            symbol = %symbol,
            order_id = %order.id,
            price,
            quantity,
            "Snipe order placed"
        );

        if config.wants_post_trade() {
            self.spawn_post_trade(order.clone(), config);
        }

        Ok(order)
    }

    /// Validate a symbol without trading
    pub async fn prevalidate_symbol(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> TradingResult<bool> {
        if self.status().await != SniperStatus::Running {
            return Err(TradingError::NotRunning);
        }
        self.fast_validate_symbol(symbol, cancel).await
    }

    /// Wait for every post-trade task spawned so far
    pub async fn wait_for_post_trade(&self) {
        let handles: Vec<JoinHandle<()>> = match self.inner.post_trade_tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Post-trade task panicked: {}", e);
            }
        }
    }

    async fn fast_validate_symbol(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> TradingResult<bool> {
        if symbol.trim().is_empty() {
            return Err(TradingError::InvalidSymbol(symbol.to_string()));
        }
        if let Some(valid) = self.inner.caches.symbol_validity(symbol) {
            return Ok(valid);
        }

        let info = cancellable(cancel, self.inner.market.symbol_info(symbol))
            .await?
            .map_err(|e| {
                tracing::error!(symbol = %symbol, error = %e, "Failed to validate symbol");
                TradingError::MarketData(e)
            })?;

        let valid = info.is_trading();
        self.inner.caches.store_symbol_validity(symbol, valid);
        Ok(valid)
    }

    async fn get_fast_price(
        &self,
        symbol: &str,
        config: &SniperConfig,
        cancel: &CancellationToken,
    ) -> TradingResult<f64> {
        if let Some(price) = self.inner.caches.fresh_price(symbol, config.price_cache_ttl) {
            return Ok(price);
        }

        let ticker = cancellable(cancel, self.inner.market.ticker(symbol))
            .await?
            .map_err(|e| {
                tracing::error!(symbol = %symbol, error = %e, "Failed to get price");
                TradingError::MarketData(e)
            })?;

        self.inner.caches.store_price(symbol, ticker.price);
        Ok(ticker.price)
    }

    async fn place_with_retries(
        &self,
        request: &OrderRequest,
        config: &SniperConfig,
        rate_limiter: &DirectRateLimiter,
        cancel: &CancellationToken,
    ) -> TradingResult<Order> {
        let attempts = config.placement_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            cancellable(cancel, rate_limiter.until_ready()).await?;

            let err = match self.inner.executor.execute_order(request, cancel).await {
                Ok(order) => return Ok(order),
                Err(TradingError::Canceled) => return Err(TradingError::Canceled),
                Err(e) => e,
            };

            if attempt >= attempts {
                tracing::error!(
                    symbol = %request.symbol,
                    attempts,
                    error = %err,
                    "Failed to place order after all retry attempts"
                );
                return Err(err);
            }

            tracing::warn!(
                symbol = %request.symbol,
                error = %err,
                "Retry placing order (attempt {}/{})",
                attempt,
                attempts
            );
            cancellable_sleep(cancel, config.retry_delay).await?;
        }
    }

    fn spawn_post_trade(&self, order: Order, config: SniperConfig) {
        let post_trade = Arc::clone(&self.inner.post_trade);
        let handle = tokio::spawn(async move {
            post_trade.run(order, config).await;
        });

        let mut tasks = match self.inner.post_trade_tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

fn spawn_cache_cleaner(caches: Arc<SniperCaches>) -> CacheCleaner {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    caches.clear();
                    tracing::debug!("Sniper caches cleared");
                }
            }
        }
    });

    CacheCleaner { cancel, handle }
}
