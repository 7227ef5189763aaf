// Core modules
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod models;
pub mod persistence;
pub mod sniper;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use api::{ExchangeClient, MarketData, MexcClient, MexcCredentials};
pub use error::{ExchangeError, StoreError, TradingError, TradingResult};
pub use execution::{ExecutorConfig, PositionMonitor, RateLimitedExecutor};
pub use models::*;
pub use persistence::{InMemoryStore, OrderStore, PositionStore};
pub use sniper::{SniperConfig, SniperEngine, SniperStatus};
