// Order execution: rate-limited exchange access, order persistence and
// position monitoring
pub mod order_queue;
pub mod position_monitor;
pub mod rate_limited;

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{TradingError, TradingResult};

pub use order_queue::{OrderSaveQueue, SaveJob, ORDER_SAVE_QUEUE_CAPACITY, ORDER_SAVE_WORKERS};
pub use position_monitor::{CheckOutcome, PositionMonitor, DEFAULT_MONITOR_INTERVAL, SCAN_TIMEOUT};
pub use rate_limited::{ExecutorConfig, OrderOp, RateLimitState, RateLimitedExecutor};

/// Await `fut` unless `cancel` fires first
pub(crate) async fn cancellable<F>(cancel: &CancellationToken, fut: F) -> TradingResult<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TradingError::Canceled),
        output = fut => Ok(output),
    }
}

/// Sleep for `duration` unless `cancel` fires first
pub(crate) async fn cancellable_sleep(
    cancel: &CancellationToken,
    duration: std::time::Duration,
) -> TradingResult<()> {
    cancellable(cancel, tokio::time::sleep(duration)).await
}
