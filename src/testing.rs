//! Scripted exchange, market data and store fakes
//!
//! Compiled for unit tests and, behind the `test-util` feature, for the
//! integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::api::{ExchangeClient, MarketData};
use crate::error::{ExchangeError, StoreError};
use crate::models::{Order, OrderRequest, OrderStatus, OrderType, Position, SymbolInfo, Ticker};
use crate::persistence::{InMemoryStore, PositionStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One `place_order` invocation as seen by the exchange
#[derive(Debug, Clone)]
pub struct PlaceCall {
    pub request: OrderRequest,
    pub at: Instant,
    pub wall_clock: DateTime<Utc>,
}

/// Exchange that replays queued results, then succeeds
///
/// Unscripted placements are accepted with ids `"1"`, `"2"`, ... and status
/// `New`. Unscripted status queries report a placed order as fully filled.
#[derive(Default)]
pub struct ScriptedExchange {
    place_results: Mutex<VecDeque<Result<Order, ExchangeError>>>,
    status_results: Mutex<VecDeque<Result<Order, ExchangeError>>>,
    cancel_results: Mutex<VecDeque<Result<(), ExchangeError>>>,
    always_fail: Mutex<Option<ExchangeError>>,
    calls: Mutex<Vec<PlaceCall>>,
    orders: Mutex<HashMap<String, Order>>,
    status_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    next_id: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    place_delay: Mutex<Option<Duration>>,
    stop_loss_supported: bool,
}

impl ScriptedExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stop_loss_support() -> Self {
        Self {
            stop_loss_supported: true,
            ..Self::default()
        }
    }

    pub fn push_place_result(&self, result: Result<Order, ExchangeError>) {
        lock(&self.place_results).push_back(result);
    }

    pub fn push_status_result(&self, result: Result<Order, ExchangeError>) {
        lock(&self.status_results).push_back(result);
    }

    pub fn push_cancel_result(&self, result: Result<(), ExchangeError>) {
        lock(&self.cancel_results).push_back(result);
    }

    /// Every unscripted placement fails with `err`
    pub fn fail_always(&self, err: ExchangeError) {
        *lock(&self.always_fail) = Some(err);
    }

    pub fn set_place_delay(&self, delay: Duration) {
        *lock(&self.place_delay) = Some(delay);
    }

    pub fn place_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    /// Highest number of placements observed in flight at once
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<PlaceCall> {
        lock(&self.calls).clone()
    }

    pub fn placed(&self) -> Vec<OrderRequest> {
        lock(&self.calls).iter().map(|call| call.request.clone()).collect()
    }

    fn accept(&self, request: &OrderRequest) -> Order {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        Order {
            id: id.to_string(),
            client_order_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            executed_qty: 0.0,
            price: request.price,
            status: OrderStatus::New,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl ExchangeClient for ScriptedExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        lock(&self.calls).push(PlaceCall {
            request: request.clone(),
            at: Instant::now(),
            wall_clock: Utc::now(),
        });

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        let delay = *lock(&self.place_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let scripted = lock(&self.place_results).pop_front();
        let order = match scripted {
            Some(result) => result?,
            None => {
                if let Some(err) = lock(&self.always_fail).clone() {
                    return Err(err);
                }
                self.accept(request)
            }
        };
        lock(&self.orders).insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), ExchangeError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.cancel_results).pop_front();
        scripted.unwrap_or(Ok(()))
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> Result<Order, ExchangeError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.status_results).pop_front();
        if let Some(result) = scripted {
            return result;
        }

        let mut order = lock(&self.orders)
            .get(order_id)
            .cloned()
            .ok_or(ExchangeError::OrderNotFound)?;
        order.status = OrderStatus::Filled;
        order.executed_qty = order.quantity;
        order.updated_at = Utc::now();
        Ok(order)
    }

    fn supports_order_type(&self, order_type: OrderType) -> bool {
        match order_type {
            OrderType::Market | OrderType::Limit => true,
            OrderType::StopLoss => self.stop_loss_supported,
        }
    }
}

/// Market data with fixed tickers and symbol statuses
#[derive(Default)]
pub struct ScriptedMarket {
    tickers: Mutex<HashMap<String, Result<f64, ExchangeError>>>,
    statuses: Mutex<HashMap<String, String>>,
    ticker_calls: AtomicUsize,
    symbol_info_calls: AtomicUsize,
}

impl ScriptedMarket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tradable symbol quoted at `price`
    pub fn listing(&self, symbol: &str, price: f64) {
        self.set_price(symbol, price);
        self.set_status(symbol, SymbolInfo::TRADING);
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        lock(&self.tickers).insert(symbol.to_string(), Ok(price));
    }

    pub fn set_ticker_error(&self, symbol: &str, err: ExchangeError) {
        lock(&self.tickers).insert(symbol.to_string(), Err(err));
    }

    pub fn set_status(&self, symbol: &str, status: &str) {
        lock(&self.statuses).insert(symbol.to_string(), status.to_string());
    }

    pub fn ticker_calls(&self) -> usize {
        self.ticker_calls.load(Ordering::SeqCst)
    }

    pub fn symbol_info_calls(&self) -> usize {
        self.symbol_info_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketData for ScriptedMarket {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        let price = lock(&self.tickers)
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Err(ExchangeError::SymbolNotSupported(symbol.to_string())))?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            price,
            volume: 1_000_000.0,
            percent_change: 0.0,
        })
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        self.symbol_info_calls.fetch_add(1, Ordering::SeqCst);
        let status = lock(&self.statuses)
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::SymbolNotSupported(symbol.to_string()))?;
        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            status,
            min_qty: 0.0,
        })
    }
}

/// Position store that counts `close` calls
#[derive(Default)]
pub struct CountingPositions {
    pub inner: InMemoryStore,
    closes: AtomicUsize,
}

impl CountingPositions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionStore for CountingPositions {
    async fn create(&self, position: &Position) -> Result<(), StoreError> {
        PositionStore::create(&self.inner, position).await
    }

    async fn save(&self, position: &Position) -> Result<Position, StoreError> {
        self.inner.save(position).await
    }

    async fn list_open(&self) -> Result<Vec<Position>, StoreError> {
        self.inner.list_open().await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Position, StoreError> {
        PositionStore::get_by_id(&self.inner, id).await
    }

    async fn update_price(&self, id: Uuid, price: f64) -> Result<Position, StoreError> {
        self.inner.update_price(id, price).await
    }

    async fn close(
        &self,
        id: Uuid,
        exit_price: f64,
        exit_order_ids: Vec<String>,
    ) -> Result<Position, StoreError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close(id, exit_price, exit_order_ids).await
    }
}

/// 429 carrying the exchange's rate-limit headers
pub fn rate_limited(reset_unix_secs: i64, remaining: u32) -> ExchangeError {
    let mut headers = HashMap::new();
    headers.insert("x-ratelimit-reset".to_string(), reset_unix_secs.to_string());
    headers.insert("x-ratelimit-remaining".to_string(), remaining.to_string());
    ExchangeError::Http {
        status: 429,
        message: "Too many requests".to_string(),
        headers,
    }
}
