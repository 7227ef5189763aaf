// New-listing sniper: symbol validation, cached pricing, admission control,
// entry placement and post-trade exit scheduling
pub mod cache;
pub mod config;
pub mod engine;
pub mod post_trade;

pub use cache::{SniperCaches, CACHE_PURGE_INTERVAL};
pub use config::{SniperConfig, SNIPER_LIMITER_BURST};
pub use engine::{SniperEngine, SniperStatus};
pub use post_trade::{ExitPlacement, ExitResult, PostTradeScheduler, FILL_POLL_INTERVAL, FILL_TIMEOUT};
