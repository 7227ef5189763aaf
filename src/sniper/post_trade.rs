use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::config::SniperConfig;
use crate::error::{TradingError, TradingResult};
use crate::execution::RateLimitedExecutor;
use crate::models::{ExitReason, Order, OrderRequest, OrderSide, OrderStatus, OrderType, Position};
use crate::persistence::PositionStore;

pub const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const FILL_TIMEOUT: Duration = Duration::from_secs(30);

/// What happened to the exit orders of one entry
#[derive(Debug, Clone, PartialEq)]
pub struct ExitPlacement {
    pub take_profit: Option<ExitResult>,
    pub stop_loss: Option<ExitResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitResult {
    pub price: f64,
    /// Exchange order id, `None` when placement failed
    pub order_id: Option<String>,
}

/// Places exit orders once an entry fills and hands the fill to the
/// position store
pub struct PostTradeScheduler {
    executor: Arc<RateLimitedExecutor>,
    positions: Option<Arc<dyn PositionStore>>,
    poll_interval: Duration,
    fill_timeout: Duration,
}

impl PostTradeScheduler {
    pub fn new(
        executor: Arc<RateLimitedExecutor>,
        positions: Option<Arc<dyn PositionStore>>,
    ) -> Self {
        Self {
            executor,
            positions,
            poll_interval: FILL_POLL_INTERVAL,
            fill_timeout: FILL_TIMEOUT,
        }
    }

    pub fn with_timings(mut self, poll_interval: Duration, fill_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.fill_timeout = fill_timeout;
        self
    }

    /// Run the whole post-trade flow for one entry order. Never fails; every
    /// problem is logged.
    pub async fn run(&self, entry: Order, config: SniperConfig) -> Option<ExitPlacement> {
        let filled = match self.wait_for_fill(&entry.symbol, &entry.id).await {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(
                    order_id = %entry.id,
                    symbol = %entry.symbol,
                    error = %e,
                    "Failed to wait for order fill"
                );
                return None;
            }
        };

        if filled.status != OrderStatus::Filled {
            tracing::warn!(
                order_id = %entry.id,
                status = filled.status.as_str(),
                "Order not filled, skipping post-trade actions"
            );
            return None;
        }

        let filled_price = filled.price;
        if !filled_price.is_finite() || filled_price <= 0.0 {
            tracing::warn!(
                order_id = %entry.id,
                filled_price,
                "Filled order has no usable price, skipping post-trade actions"
            );
            return None;
        }
        let quantity = if filled.executed_qty > 0.0 {
            filled.executed_qty
        } else {
            filled.quantity
        };

        let placement = self
            .place_exit_orders(&filled.symbol, filled_price, quantity, &config)
            .await;

        if let Some(positions) = &self.positions {
            open_position(positions.as_ref(), &filled, filled_price, quantity, &placement).await;
        }

        Some(placement)
    }

    /// Poll until the order reaches a terminal state or the fill timeout passes
    pub async fn wait_for_fill(&self, symbol: &str, order_id: &str) -> TradingResult<Order> {
        let cancel = CancellationToken::new();
        let poll = async {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.executor.get_order_status(symbol, order_id, &cancel).await {
                    Ok(order) if order.status.is_terminal() => return order,
                    Ok(order) => tracing::debug!(
                        order_id = %order_id,
                        status = order.status.as_str(),
                        executed_qty = order.executed_qty,
                        "Waiting for fill"
                    ),
                    Err(e) => tracing::warn!(
                        order_id = %order_id,
                        error = %e,
                        "Error checking order status"
                    ),
                }
            }
        };

        let result = tokio::time::timeout(self.fill_timeout, poll).await;
        cancel.cancel();
        result.map_err(|_| TradingError::Timeout(self.fill_timeout))
    }

    /// Place take-profit and stop-loss sells concurrently. A failure of one
    /// leg does not affect the other.
    pub async fn place_exit_orders(
        &self,
        symbol: &str,
        filled_price: f64,
        quantity: f64,
        config: &SniperConfig,
    ) -> ExitPlacement {
        let cancel = CancellationToken::new();

        let take_profit = async {
            if !config.enable_take_profit {
                return None;
            }
            let price = config.take_profit_price(filled_price);
            let request = OrderRequest::limit(symbol, OrderSide::Sell, quantity, price);
            Some(self.place_exit("take-profit", request, price, &cancel).await)
        };

        let stop_loss = async {
            if !config.enable_stop_loss {
                return None;
            }
            let price = config.stop_loss_price(filled_price);
            let request = if self.executor.client().supports_order_type(OrderType::StopLoss) {
                OrderRequest::stop_loss(symbol, OrderSide::Sell, quantity, price)
            } else {
                OrderRequest::limit(symbol, OrderSide::Sell, quantity, price)
            };
            Some(self.place_exit("stop-loss", request, price, &cancel).await)
        };

        let (take_profit, stop_loss) = tokio::join!(take_profit, stop_loss);
        ExitPlacement {
            take_profit,
            stop_loss,
        }
    }

    async fn place_exit(
        &self,
        kind: &'static str,
        request: OrderRequest,
        price: f64,
        cancel: &CancellationToken,
    ) -> ExitResult {
        match self.executor.execute_order(&request, cancel).await {
            Ok(order) => {
                tracing::info!(
                    kind,
                    symbol = %request.symbol,
                    order_id = %order.id,
                    order_type = request.order_type.as_str(),
                    price,
                    "Exit order placed"
                );
                ExitResult {
                    price,
                    order_id: Some(order.id),
                }
            }
            Err(e) => {
                tracing::error!(
                    kind,
                    symbol = %request.symbol,
                    price,
                    error = %e,
                    "Failed to place exit order"
                );
                ExitResult {
                    price,
                    order_id: None,
                }
            }
        }
    }
}

/// Record the filled entry as a long position. Exit levels without a resting
/// exchange order are left on the position for the monitor to enforce; placed
/// legs are recorded by order id so the monitor can watch them fill.
async fn open_position(
    positions: &dyn PositionStore,
    filled: &Order,
    filled_price: f64,
    quantity: f64,
    placement: &ExitPlacement,
) {
    let unplaced = |leg: &Option<ExitResult>| {
        leg.as_ref()
            .filter(|exit| exit.order_id.is_none())
            .map(|exit| exit.price)
    };
    let stop_loss = unplaced(&placement.stop_loss);
    let take_profit = unplaced(&placement.take_profit);

    let mut position = match Position::new_long(
        filled.symbol.clone(),
        filled_price,
        quantity,
        stop_loss,
        take_profit,
    ) {
        Ok(position) => position,
        Err(reason) => {
            tracing::warn!(
                order_id = %filled.id,
                reason = %reason,
                "Exit levels rejected, opening position without them"
            );
            match Position::new_long(filled.symbol.clone(), filled_price, quantity, None, None) {
                Ok(position) => position,
                Err(reason) => {
                    tracing::error!(order_id = %filled.id, reason = %reason, "Cannot open position");
                    return;
                }
            }
        }
    };

    let placed = [
        (ExitReason::StopLoss, &placement.stop_loss),
        (ExitReason::TakeProfit, &placement.take_profit),
    ];
    for (reason, leg) in placed {
        if let Some(order_id) = leg.as_ref().and_then(|exit| exit.order_id.as_deref()) {
            position.attach_exit_order(reason, order_id);
        }
    }

    match positions.create(&position).await {
        Ok(()) => tracing::info!(
            position_id = %position.id,
            symbol = %position.symbol,
            entry_price = filled_price,
            quantity,
            stop_loss = ?position.stop_loss,
            take_profit = ?position.take_profit,
            take_profit_order_id = ?position.take_profit_order_id,
            stop_loss_order_id = ?position.stop_loss_order_id,
            "Opened position from filled entry"
        ),
        Err(e) => tracing::error!(
            order_id = %filled.id,
            error = %e,
            "Failed to record position"
        ),
    }
}
