use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{cancellable, RateLimitedExecutor};
use crate::api::MarketData;
use crate::error::{TradingError, TradingResult};
use crate::models::{ExitReason, OrderRequest, OrderStatus, Position};
use crate::persistence::PositionStore;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(15);

/// Time budget of one full scan over the open positions
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of evaluating one position
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Closed, or nothing to enforce
    Skipped,
    /// Price refreshed, no level crossed
    Held { current_price: f64 },
    Closed { reason: ExitReason, position: Position },
}

/// State of a position after its resting exit orders were polled
enum Reconciled {
    Done(CheckOutcome),
    Open(Position),
}

struct MonitorInner {
    positions: Arc<dyn PositionStore>,
    market: Arc<dyn MarketData>,
    executor: Arc<RateLimitedExecutor>,
}

struct Scanner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodically closes open positions whose stop-loss or take-profit was
/// crossed, or whose exit order resting on the exchange has filled
pub struct PositionMonitor {
    inner: Arc<MonitorInner>,
    interval: Duration,
    scanner: Mutex<Option<Scanner>>,
}

impl PositionMonitor {
    pub fn new(
        positions: Arc<dyn PositionStore>,
        market: Arc<dyn MarketData>,
        executor: Arc<RateLimitedExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                positions,
                market,
                executor,
            }),
            interval: DEFAULT_MONITOR_INTERVAL,
            scanner: Mutex::new(None),
        }
    }

    /// Scan interval used by the next `start`
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn is_running(&self) -> bool {
        self.scanner.lock().await.is_some()
    }

    /// Launch the scanner task. No-op when already running.
    pub async fn start(&self) {
        let mut scanner = self.scanner.lock().await;
        if scanner.is_some() {
            tracing::warn!("Position monitor is already running");
            return;
        }

        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let interval = self.interval;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; the first scan runs one interval in
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.check_positions(&token).await {
                            if !e.is_canceled() {
                                tracing::error!(error = %e, "Position scan failed");
                            }
                        }
                    }
                }
            }
        });

        *scanner = Some(Scanner { cancel, handle });
        tracing::info!(interval_ms = interval.as_millis() as u64, "Position monitor started");
    }

    /// Signal the scanner to exit and wait for it. No-op when stopped.
    pub async fn stop(&self) {
        let mut scanner = self.scanner.lock().await;
        let Some(Scanner { cancel, handle }) = scanner.take() else {
            tracing::warn!("Position monitor is not running");
            return;
        };

        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!("Position monitor task panicked: {}", e);
        }
        tracing::info!("Position monitor stopped");
    }

    /// Run one scan over all open positions. Per-position failures are
    /// logged and left for the next scan. Returns the number of positions closed.
    pub async fn check_positions(&self, cancel: &CancellationToken) -> TradingResult<usize> {
        self.inner.check_positions(cancel).await
    }

    /// Evaluate one position on demand
    pub async fn check_position(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> TradingResult<CheckOutcome> {
        let position = cancellable(cancel, self.inner.positions.get_by_id(id)).await??;
        self.inner.evaluate(&position, cancel).await
    }
}

impl MonitorInner {
    async fn check_positions(&self, cancel: &CancellationToken) -> TradingResult<usize> {
        match tokio::time::timeout(SCAN_TIMEOUT, self.scan(cancel)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_ms = SCAN_TIMEOUT.as_millis() as u64, "Position scan timed out");
                Err(TradingError::Timeout(SCAN_TIMEOUT))
            }
        }
    }

    async fn scan(&self, cancel: &CancellationToken) -> TradingResult<usize> {
        let positions = cancellable(cancel, self.positions.list_open()).await??;
        if positions.is_empty() {
            return Ok(0);
        }

        tracing::debug!(count = positions.len(), "Checking positions for stop-loss/take-profit");

        let mut closed = 0;
        for position in positions.iter().filter(|p| p.needs_monitoring()) {
            match self.evaluate(position, cancel).await {
                Ok(CheckOutcome::Closed { .. }) => closed += 1,
                Ok(_) => {}
                Err(TradingError::Canceled) => return Err(TradingError::Canceled),
                Err(e) => tracing::error!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    error = %e,
                    "Failed to check position"
                ),
            }
        }

        Ok(closed)
    }

    async fn evaluate(
        &self,
        position: &Position,
        cancel: &CancellationToken,
    ) -> TradingResult<CheckOutcome> {
        if !position.needs_monitoring() {
            return Ok(CheckOutcome::Skipped);
        }

        let position = match self.reconcile_resting_exits(position.clone(), cancel).await? {
            Reconciled::Done(outcome) => return Ok(outcome),
            Reconciled::Open(position) => position,
        };

        let ticker = cancellable(cancel, self.market.ticker(&position.symbol))
            .await?
            .map_err(TradingError::MarketData)?;
        let current_price = ticker.price;

        let updated = cancellable(cancel, self.positions.update_price(position.id, current_price))
            .await??;

        let Some(reason) = updated.exit_trigger(current_price) else {
            return Ok(CheckOutcome::Held { current_price });
        };

        tracing::info!(
            position_id = %updated.id,
            symbol = %updated.symbol,
            side = updated.side.as_str(),
            reason = ?reason,
            stop_loss = ?updated.stop_loss,
            take_profit = ?updated.take_profit,
            current_price,
            "Exit level triggered"
        );

        // Pull resting legs first so the market exit cannot be doubled by a late fill.
        // A failed cancel leaves the position for the next scan to reconcile.
        for (_, order_id) in updated.resting_exit_orders() {
            self.executor
                .cancel_order(&updated.symbol, &order_id, cancel)
                .await?;
        }

        let request = OrderRequest::market(
            updated.symbol.clone(),
            updated.side.closing_order_side(),
            updated.quantity,
        );
        let order = self.executor.execute_order(&request, cancel).await?;

        let closed = cancellable(
            cancel,
            self.positions.close(updated.id, current_price, vec![order.id.clone()]),
        )
        .await??;

        tracing::info!(
            position_id = %closed.id,
            symbol = %closed.symbol,
            reason = ?reason,
            exit_price = current_price,
            pnl = closed.pnl,
            exit_order_id = %order.id,
            "Position closed"
        );

        Ok(CheckOutcome::Closed {
            reason,
            position: closed,
        })
    }

    /// Poll the exit orders resting on the exchange. A filled leg closes the
    /// position and the other legs are canceled. A leg that ended unfilled is
    /// dropped and its price becomes a monitored level again.
    async fn reconcile_resting_exits(
        &self,
        mut position: Position,
        cancel: &CancellationToken,
    ) -> TradingResult<Reconciled> {
        let resting = position.resting_exit_orders();
        if resting.is_empty() {
            return Ok(Reconciled::Open(position));
        }

        let mut detached = false;
        for (reason, order_id) in &resting {
            let order = self
                .executor
                .get_order_status(&position.symbol, order_id, cancel)
                .await?;

            match order.status {
                OrderStatus::Filled => {
                    let exit_price = if order.price > 0.0 {
                        order.price
                    } else {
                        position.current_price
                    };
                    let closed = cancellable(
                        cancel,
                        self.positions.close(position.id, exit_price, vec![order_id.clone()]),
                    )
                    .await??;

                    tracing::info!(
                        position_id = %closed.id,
                        symbol = %closed.symbol,
                        reason = ?reason,
                        exit_price,
                        pnl = closed.pnl,
                        exit_order_id = %order_id,
                        "Resting exit order filled, position closed"
                    );

                    for (_, other) in resting.iter().filter(|(_, id)| id != order_id) {
                        if let Err(e) = self.executor.cancel_order(&closed.symbol, other, cancel).await {
                            tracing::error!(
                                position_id = %closed.id,
                                order_id = %other,
                                error = %e,
                                "Failed to cancel remaining exit order"
                            );
                        }
                    }

                    return Ok(Reconciled::Done(CheckOutcome::Closed {
                        reason: *reason,
                        position: closed,
                    }));
                }
                status if status.is_terminal() => {
                    tracing::warn!(
                        position_id = %position.id,
                        order_id = %order_id,
                        status = status.as_str(),
                        "Resting exit order ended unfilled, monitoring its level instead"
                    );
                    position.detach_exit_order(*reason, Some(order.price));
                    detached = true;
                }
                _ => {}
            }
        }

        if detached {
            let saved = cancellable(cancel, self.positions.save(&position)).await??;
            if !saved.is_open() {
                return Ok(Reconciled::Done(CheckOutcome::Skipped));
            }
            position = saved;
        }
        Ok(Reconciled::Open(position))
    }
}
