// Exchange access contracts and the MEXC REST implementation
pub mod mexc;

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::models::{Order, OrderRequest, OrderType, SymbolInfo, Ticker};

pub use mexc::{MexcClient, MexcCredentials};

/// Stateless order-management request layer of one exchange
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<Order, ExchangeError>;

    /// Whether the exchange accepts this order type natively
    fn supports_order_type(&self, order_type: OrderType) -> bool {
        matches!(order_type, OrderType::Market | OrderType::Limit)
    }
}

/// Read-only market data
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError>;
}
