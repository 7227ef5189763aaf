use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Order type
///
/// `StopLoss` is only sent to exchanges that report support for it through
/// [`crate::api::ExchangeClient::supports_order_type`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOP_LOSS",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    #[default]
    Gtc,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
        }
    }
}

/// Exchange-side order status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Filled, canceled, rejected and expired orders never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    /// Progress toward a terminal state
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::PartiallyFilled => 1,
            _ => 2,
        }
    }

    /// Whether a stored order in this status may be overwritten with `next`.
    /// Status never moves backwards and never leaves a terminal state.
    pub fn can_advance_to(&self, next: OrderStatus) -> bool {
        *self == next || (!self.is_terminal() && next.rank() > self.rank())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    /// Parse the exchange vocabulary. MEXC uses `PARTIALLY_CANCELED` for
    /// partially filled orders that were then canceled.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" | "PARTIALLY_CANCELED" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

/// A request to place one order. Built per call and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price. Ignored for market orders.
    pub price: f64,
    /// Trigger price for stop-loss orders.
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: 0.0,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
        }
    }

    pub fn stop_loss(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::StopLoss,
            quantity,
            price: stop_price,
            stop_price: Some(stop_price),
            time_in_force: TimeInForce::Gtc,
        }
    }

    /// Check the request before it is sent anywhere
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol is empty".to_string());
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(format!("quantity must be positive, got {}", self.quantity));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(format!("price must be non-negative, got {}", self.price));
        }
        match self.order_type {
            OrderType::Limit if self.price <= 0.0 => {
                Err("limit order requires a positive price".to_string())
            }
            OrderType::StopLoss => match self.stop_price {
                Some(stop) if stop.is_finite() && stop > 0.0 => Ok(()),
                _ => Err("stop-loss order requires a positive stop price".to_string()),
            },
            _ => Ok(()),
        }
    }
}

/// An order as known by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub executed_qty: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    /// Executed quantity capped at the order quantity
    pub fn clamped_executed_qty(&self) -> f64 {
        if self.quantity > 0.0 {
            self.executed_qty.min(self.quantity)
        } else {
            self.executed_qty
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side of the market order that closes a position on this side
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

/// Position in a token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub status: PositionStatus,
    pub entry_price: f64,
    pub quantity: f64,
    pub current_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub exit_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_order_ids: Vec<String>,
    /// Take-profit order resting on the exchange
    #[serde(default)]
    pub take_profit_order_id: Option<String>,
    /// Stop-loss order resting on the exchange
    #[serde(default)]
    pub stop_loss_order_id: Option<String>,
}

impl Position {
    pub fn new_long(
        symbol: impl Into<String>,
        entry_price: f64,
        quantity: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<Self, String> {
        Self::open(symbol, PositionSide::Long, entry_price, quantity, stop_loss, take_profit)
    }

    pub fn new_short(
        symbol: impl Into<String>,
        entry_price: f64,
        quantity: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<Self, String> {
        Self::open(symbol, PositionSide::Short, entry_price, quantity, stop_loss, take_profit)
    }

    fn open(
        symbol: impl Into<String>,
        side: PositionSide,
        entry_price: f64,
        quantity: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<Self, String> {
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(format!("entry price must be positive, got {}", entry_price));
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(format!("quantity must be positive, got {}", quantity));
        }

        // Exit levels must sit on the losing / winning side of the entry
        match side {
            PositionSide::Long => {
                if stop_loss.is_some_and(|sl| sl >= entry_price) {
                    return Err("stop-loss must be below entry price for long positions".into());
                }
                if take_profit.is_some_and(|tp| tp <= entry_price) {
                    return Err("take-profit must be above entry price for long positions".into());
                }
            }
            PositionSide::Short => {
                if stop_loss.is_some_and(|sl| sl <= entry_price) {
                    return Err("stop-loss must be above entry price for short positions".into());
                }
                if take_profit.is_some_and(|tp| tp >= entry_price) {
                    return Err("take-profit must be below entry price for short positions".into());
                }
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            status: PositionStatus::Open,
            entry_price,
            quantity,
            current_price: entry_price,
            stop_loss,
            take_profit,
            pnl: 0.0,
            pnl_percent: 0.0,
            exit_price: None,
            opened_at: Utc::now(),
            closed_at: None,
            exit_order_ids: Vec::new(),
            take_profit_order_id: None,
            stop_loss_order_id: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// True when at least one exit level is set
    pub fn has_exit_levels(&self) -> bool {
        self.stop_loss.is_some() || self.take_profit.is_some()
    }

    pub fn has_resting_exit_orders(&self) -> bool {
        self.stop_loss_order_id.is_some() || self.take_profit_order_id.is_some()
    }

    /// Open and guarded by a level or a resting exit order
    pub fn needs_monitoring(&self) -> bool {
        self.is_open() && (self.has_exit_levels() || self.has_resting_exit_orders())
    }

    pub fn attach_exit_order(&mut self, reason: ExitReason, order_id: impl Into<String>) {
        match reason {
            ExitReason::StopLoss => self.stop_loss_order_id = Some(order_id.into()),
            ExitReason::TakeProfit => self.take_profit_order_id = Some(order_id.into()),
        }
    }

    /// Resting exit orders, stop-loss first
    pub fn resting_exit_orders(&self) -> Vec<(ExitReason, String)> {
        let mut orders = Vec::with_capacity(2);
        if let Some(id) = &self.stop_loss_order_id {
            orders.push((ExitReason::StopLoss, id.clone()));
        }
        if let Some(id) = &self.take_profit_order_id {
            orders.push((ExitReason::TakeProfit, id.clone()));
        }
        orders
    }

    /// Forget a resting exit order that ended without a fill. `level` is put
    /// back on the position when it still sits on the correct side of the entry.
    pub fn detach_exit_order(&mut self, reason: ExitReason, level: Option<f64>) {
        let level = level.filter(|price| self.level_brackets_entry(reason, *price));
        match reason {
            ExitReason::StopLoss => {
                self.stop_loss_order_id = None;
                if level.is_some() {
                    self.stop_loss = level;
                }
            }
            ExitReason::TakeProfit => {
                self.take_profit_order_id = None;
                if level.is_some() {
                    self.take_profit = level;
                }
            }
        }
    }

    fn level_brackets_entry(&self, reason: ExitReason, price: f64) -> bool {
        if !price.is_finite() || price <= 0.0 {
            return false;
        }
        match (self.side, reason) {
            (PositionSide::Long, ExitReason::StopLoss) => price < self.entry_price,
            (PositionSide::Long, ExitReason::TakeProfit) => price > self.entry_price,
            (PositionSide::Short, ExitReason::StopLoss) => price > self.entry_price,
            (PositionSide::Short, ExitReason::TakeProfit) => price < self.entry_price,
        }
    }

    fn pnl_at(&self, price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - price) * self.quantity,
        }
    }

    /// Record a new market price and recompute unrealized P&L
    pub fn update_current_price(&mut self, price: f64) {
        self.current_price = price;
        self.pnl = self.pnl_at(price);
        let cost_basis = self.entry_price * self.quantity;
        self.pnl_percent = if cost_basis > 0.0 {
            self.pnl / cost_basis * 100.0
        } else {
            0.0
        };
    }

    /// Close the position. Closing an already closed position is a no-op.
    pub fn close(&mut self, exit_price: f64, exit_order_ids: Vec<String>) {
        if !self.is_open() {
            return;
        }
        self.update_current_price(exit_price);
        self.exit_price = Some(exit_price);
        self.exit_order_ids = exit_order_ids;
        self.stop_loss_order_id = None;
        self.take_profit_order_id = None;
        self.status = PositionStatus::Closed;
        self.closed_at = Some(Utc::now());
    }

    pub fn is_stop_loss_triggered(&self, current_price: f64) -> bool {
        let Some(stop_loss) = self.stop_loss else {
            return false;
        };
        match self.side {
            PositionSide::Long => current_price <= stop_loss,
            PositionSide::Short => current_price >= stop_loss,
        }
    }

    pub fn is_take_profit_triggered(&self, current_price: f64) -> bool {
        let Some(take_profit) = self.take_profit else {
            return false;
        };
        match self.side {
            PositionSide::Long => current_price >= take_profit,
            PositionSide::Short => current_price <= take_profit,
        }
    }

    /// Stop-loss wins when both levels are crossed
    pub fn exit_trigger(&self, current_price: f64) -> Option<ExitReason> {
        if self.is_stop_loss_triggered(current_price) {
            Some(ExitReason::StopLoss)
        } else if self.is_take_profit_triggered(current_price) {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }
}

/// 24h ticker snapshot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub percent_change: f64,
}

/// Trading rules of one symbol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub min_qty: f64,
}

impl SymbolInfo {
    pub const TRADING: &'static str = "TRADING";

    pub fn is_trading(&self) -> bool {
        self.status == Self::TRADING
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(stop_loss: Option<f64>, take_profit: Option<f64>) -> Position {
        Position::new_long("BTC_USDT", 10000.0, 0.1, stop_loss, take_profit).unwrap()
    }

    fn short(stop_loss: Option<f64>, take_profit: Option<f64>) -> Position {
        Position::new_short("ETH_USDT", 2500.0, 1.0, stop_loss, take_profit).unwrap()
    }

    #[test]
    fn test_order_request_validation() {
        assert!(OrderRequest::market("NEW_USDT", OrderSide::Buy, 200.0).validate().is_ok());
        assert!(OrderRequest::market("NEW_USDT", OrderSide::Buy, 0.0).validate().is_err());
        assert!(OrderRequest::market("", OrderSide::Buy, 1.0).validate().is_err());
        assert!(OrderRequest::limit("NEW_USDT", OrderSide::Sell, 1.0, 0.0).validate().is_err());
        assert!(OrderRequest::limit("NEW_USDT", OrderSide::Sell, 1.0, 0.6).validate().is_ok());
        assert!(OrderRequest::stop_loss("NEW_USDT", OrderSide::Sell, 1.0, 0.45)
            .validate()
            .is_ok());

        let mut negative_price = OrderRequest::market("NEW_USDT", OrderSide::Buy, 1.0);
        negative_price.price = -1.0;
        assert!(negative_price.validate().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(OrderStatus::parse("FILLED"), Some(OrderStatus::Filled));
        assert_eq!(OrderStatus::parse("partially_filled"), Some(OrderStatus::PartiallyFilled));
        assert_eq!(OrderStatus::parse("PARTIALLY_CANCELED"), Some(OrderStatus::Canceled));
        assert_eq!(OrderStatus::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_status_only_advances() {
        assert!(OrderStatus::New.can_advance_to(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::New.can_advance_to(OrderStatus::Filled));
        assert!(OrderStatus::PartiallyFilled.can_advance_to(OrderStatus::Canceled));
        assert!(OrderStatus::PartiallyFilled.can_advance_to(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::Filled.can_advance_to(OrderStatus::Filled));

        assert!(!OrderStatus::Filled.can_advance_to(OrderStatus::New));
        assert!(!OrderStatus::PartiallyFilled.can_advance_to(OrderStatus::New));
        assert!(!OrderStatus::Filled.can_advance_to(OrderStatus::Canceled));
        assert!(!OrderStatus::Canceled.can_advance_to(OrderStatus::Filled));
    }

    #[test]
    fn test_bracket_invariant() {
        assert!(Position::new_long("A", 100.0, 1.0, Some(90.0), Some(120.0)).is_ok());
        assert!(Position::new_long("A", 100.0, 1.0, Some(100.0), None).is_err());
        assert!(Position::new_long("A", 100.0, 1.0, None, Some(95.0)).is_err());
        assert!(Position::new_short("A", 100.0, 1.0, Some(110.0), Some(80.0)).is_ok());
        assert!(Position::new_short("A", 100.0, 1.0, Some(95.0), None).is_err());
        assert!(Position::new_short("A", 100.0, 1.0, None, Some(105.0)).is_err());
        assert!(Position::new_long("A", 0.0, 1.0, None, None).is_err());
    }

    #[test]
    fn test_long_trigger_truth_table() {
        let position = long(Some(9000.0), Some(11000.0));

        assert!(position.is_stop_loss_triggered(8900.0));
        assert!(position.is_stop_loss_triggered(9000.0));
        assert!(!position.is_stop_loss_triggered(9000.01));

        assert!(position.is_take_profit_triggered(11000.0));
        assert!(position.is_take_profit_triggered(12000.0));
        assert!(!position.is_take_profit_triggered(10999.0));

        assert_eq!(position.exit_trigger(8900.0), Some(ExitReason::StopLoss));
        assert_eq!(position.exit_trigger(11500.0), Some(ExitReason::TakeProfit));
        assert_eq!(position.exit_trigger(10000.0), None);
    }

    #[test]
    fn test_short_trigger_truth_table() {
        let position = short(Some(2700.0), Some(2000.0));

        assert!(position.is_stop_loss_triggered(2700.0));
        assert!(position.is_stop_loss_triggered(2800.0));
        assert!(!position.is_stop_loss_triggered(2600.0));

        assert!(position.is_take_profit_triggered(2000.0));
        assert!(position.is_take_profit_triggered(1900.0));
        assert!(!position.is_take_profit_triggered(2100.0));

        assert_eq!(position.exit_trigger(1900.0), Some(ExitReason::TakeProfit));
        assert_eq!(position.exit_trigger(2750.0), Some(ExitReason::StopLoss));
    }

    #[test]
    fn test_missing_levels_never_trigger() {
        let position = long(None, None);
        assert!(!position.has_exit_levels());
        assert_eq!(position.exit_trigger(0.0001), None);
        assert_eq!(position.exit_trigger(1_000_000.0), None);
    }

    #[test]
    fn test_stop_loss_checked_before_take_profit() {
        // Levels mutated past each other: both crossed at once
        let mut position = long(Some(9000.0), Some(11000.0));
        position.stop_loss = Some(12000.0);
        assert!(position.is_take_profit_triggered(11500.0));
        assert_eq!(position.exit_trigger(11500.0), Some(ExitReason::StopLoss));
    }

    #[test]
    fn test_pnl_calculation() {
        let mut position = long(None, None);
        position.update_current_price(11000.0);
        assert!((position.pnl - 100.0).abs() < 1e-9); // 0.1 * (11000 - 10000)
        assert!((position.pnl_percent - 10.0).abs() < 1e-9);

        let mut position = short(None, None);
        position.update_current_price(2000.0);
        assert!((position.pnl - 500.0).abs() < 1e-9);
        assert!((position.pnl_percent - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_close_position() {
        let mut position = long(Some(9000.0), None);
        position.close(8900.0, vec!["exit-1".to_string()]);

        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.exit_price, Some(8900.0));
        assert!(position.closed_at.is_some());
        assert_eq!(position.exit_order_ids, vec!["exit-1".to_string()]);

        // Second close keeps the first exit
        position.close(7000.0, vec!["exit-2".to_string()]);
        assert_eq!(position.exit_price, Some(8900.0));
        assert_eq!(position.exit_order_ids, vec!["exit-1".to_string()]);
    }

    #[test]
    fn test_resting_exit_orders() {
        let mut position = long(None, None);
        assert!(!position.needs_monitoring());

        position.attach_exit_order(ExitReason::TakeProfit, "tp-1");
        position.attach_exit_order(ExitReason::StopLoss, "sl-1");
        assert!(position.needs_monitoring());
        assert_eq!(
            position.resting_exit_orders(),
            vec![
                (ExitReason::StopLoss, "sl-1".to_string()),
                (ExitReason::TakeProfit, "tp-1".to_string())
            ]
        );

        // Canceled stop-loss hands its level back to the monitor
        position.detach_exit_order(ExitReason::StopLoss, Some(9000.0));
        assert_eq!(position.stop_loss_order_id, None);
        assert_eq!(position.stop_loss, Some(9000.0));

        // A level on the wrong side of the entry is dropped
        position.detach_exit_order(ExitReason::TakeProfit, Some(9500.0));
        assert_eq!(position.take_profit_order_id, None);
        assert_eq!(position.take_profit, None);

        position.attach_exit_order(ExitReason::TakeProfit, "tp-2");
        position.close(11000.0, vec!["tp-2".to_string()]);
        assert!(!position.has_resting_exit_orders());
        assert!(!position.needs_monitoring());
    }

    #[test]
    fn test_closing_side() {
        assert_eq!(PositionSide::Long.closing_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_order_side(), OrderSide::Buy);
    }
}
