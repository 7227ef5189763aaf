use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use snipebot::testing::{rate_limited, ScriptedExchange};
use snipebot::error::{ExchangeError, TradingError};
use snipebot::execution::{ExecutorConfig, RateLimitedExecutor};
use snipebot::models::{OrderRequest, OrderSide};

fn executor(exchange: &Arc<ScriptedExchange>, config: ExecutorConfig) -> RateLimitedExecutor {
    RateLimitedExecutor::new(exchange.clone(), config).unwrap()
}

fn buy() -> OrderRequest {
    OrderRequest::market("NEW_USDT", OrderSide::Buy, 10.0)
}

#[tokio::test]
async fn test_calls_per_second_stay_within_bucket() {
    let exchange = Arc::new(ScriptedExchange::new());
    let config = ExecutorConfig {
        requests_per_second: 5.0,
        burst_size: 2,
        max_retries: 0,
        ..ExecutorConfig::default()
    };
    let executor = Arc::new(executor(&exchange, config));

    let mut tasks = JoinSet::new();
    for _ in 0..12 {
        let executor = executor.clone();
        tasks.spawn(async move { executor.execute_order(&buy(), &CancellationToken::new()).await });
    }
    while let Some(result) = tasks.join_next().await {
        assert_ok!(result.unwrap());
    }

    let times: Vec<Instant> = exchange.calls().iter().map(|c| c.at).collect();
    assert_eq!(times.len(), 12);

    // burst + ceil(rps)
    let ceiling = 2 + 5;
    for start in &times {
        let in_window = times
            .iter()
            .filter(|t| **t >= *start && t.duration_since(*start) < Duration::from_secs(1))
            .count();
        assert!(in_window <= ceiling, "{} calls within one second", in_window);
    }
}

#[tokio::test]
async fn test_no_call_before_reset_window() {
    let exchange = Arc::new(ScriptedExchange::new());
    let reset_at = Utc::now().timestamp() + 2;
    exchange.push_place_result(Err(rate_limited(reset_at, 0)));

    let config = ExecutorConfig {
        initial_retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(50),
        ..ExecutorConfig::default()
    };
    let executor = executor(&exchange, config);

    let order = executor
        .execute_order(&buy(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(order.symbol, "NEW_USDT");

    let calls = exchange.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].wall_clock.timestamp() >= reset_at);
}

#[tokio::test]
async fn test_non_retryable_called_once() {
    for err in [
        ExchangeError::http(400, "bad request"),
        ExchangeError::OrderNotFound,
        ExchangeError::SymbolNotSupported("NEW_USDT".to_string()),
        ExchangeError::Other("boom".to_string()),
    ] {
        let exchange = Arc::new(ScriptedExchange::new());
        exchange.fail_always(err);
        let executor = executor(&exchange, ExecutorConfig::default());

        assert_err!(executor.execute_order(&buy(), &CancellationToken::new()).await);
        assert_eq!(exchange.place_calls(), 1);
    }
}

#[tokio::test]
async fn test_retryable_bounded_by_max_retries() {
    for err in [
        ExchangeError::http(503, "unavailable"),
        ExchangeError::Timeout,
        ExchangeError::ConnectionReset,
        ExchangeError::NetworkFailure("refused".to_string()),
    ] {
        let exchange = Arc::new(ScriptedExchange::new());
        exchange.fail_always(err);
        let config = ExecutorConfig {
            requests_per_second: 100.0,
            burst_size: 10,
            max_retries: 2,
            initial_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(20),
        };
        let executor = executor(&exchange, config);

        let err = executor
            .execute_order(&buy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(exchange.place_calls(), 3);
    }
}

#[tokio::test]
async fn test_cancel_stops_further_calls() {
    let exchange = Arc::new(ScriptedExchange::new());
    exchange.fail_always(ExchangeError::http(502, "bad gateway"));
    let config = ExecutorConfig {
        initial_retry_delay: Duration::from_secs(2),
        max_retry_delay: Duration::from_secs(5),
        ..ExecutorConfig::default()
    };
    let executor = executor(&exchange, config);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = executor.execute_order(&buy(), &cancel).await.unwrap_err();
    assert!(err.is_canceled());
    assert!(started.elapsed() < Duration::from_secs(1));

    let calls = exchange.place_calls();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(exchange.place_calls(), calls);
    assert_eq!(calls, 1);
}
