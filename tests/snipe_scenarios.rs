use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use snipebot::testing::{rate_limited, ScriptedExchange, ScriptedMarket};
use snipebot::error::TradingError;
use snipebot::execution::{ExecutorConfig, PositionMonitor, RateLimitedExecutor};
use snipebot::models::{OrderRequest, OrderSide, OrderType};
use snipebot::persistence::{InMemoryStore, OrderStore, PositionStore};
use snipebot::sniper::{SniperConfig, SniperEngine};

struct Harness {
    exchange: Arc<ScriptedExchange>,
    market: Arc<ScriptedMarket>,
    orders: Arc<InMemoryStore>,
    executor: Arc<RateLimitedExecutor>,
}

fn harness() -> Harness {
    let exchange = Arc::new(ScriptedExchange::new());
    let market = Arc::new(ScriptedMarket::new());
    market.listing("NEW_USDT", 0.5);
    let orders = Arc::new(InMemoryStore::new());

    let config = ExecutorConfig {
        requests_per_second: 100.0,
        burst_size: 20,
        ..ExecutorConfig::default()
    };
    let executor = RateLimitedExecutor::new(exchange.clone(), config)
        .unwrap()
        .with_order_store(orders.clone());

    Harness {
        exchange,
        market,
        orders,
        executor: Arc::new(executor),
    }
}

fn sniper_config() -> SniperConfig {
    SniperConfig {
        max_buy_amount: 100.0,
        max_price_per_token: 1.0,
        preferred_order_type: OrderType::Market,
        retry_attempts: 1,
        ..SniperConfig::default()
    }
}

async fn running_engine(h: &Harness, config: SniperConfig) -> SniperEngine {
    let engine = SniperEngine::new(h.executor.clone(), h.market.clone(), config).unwrap();
    engine.start().await;
    engine
}

#[tokio::test]
async fn test_happy_path_snipe() {
    let h = harness();
    let engine = running_engine(&h, sniper_config()).await;

    let order = engine
        .execute_snipe("NEW_USDT", &CancellationToken::new())
        .await
        .unwrap();

    let calls = h.exchange.calls();
    assert_eq!(calls.len(), 1);
    let request = &calls[0].request;
    assert_eq!(request.symbol, "NEW_USDT");
    assert_eq!(request.side, OrderSide::Buy);
    assert_eq!(request.order_type, OrderType::Market);
    assert!((request.quantity - 200.0).abs() < 1e-9);
    assert_eq!(request.price, 0.5);
    assert_eq!(order.id, "1");

    engine.stop().await;
    h.executor.shutdown().await;
    assert_eq!(h.orders.order_count(), 1);
    assert_ok!(OrderStore::get_by_id(h.orders.as_ref(), "1").await);
}

#[tokio::test]
async fn test_price_above_cap() {
    let h = harness();
    let config = SniperConfig {
        max_price_per_token: 0.4,
        ..sniper_config()
    };
    let engine = running_engine(&h, config).await;

    let err = engine
        .execute_snipe("NEW_USDT", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TradingError::MaxPriceExceeded { price, max } if price == 0.5 && max == 0.4));
    assert_eq!(h.exchange.place_calls(), 0);
}

#[tokio::test]
async fn test_rate_limit_then_success() {
    let h = harness();
    h.exchange.push_place_result(Err(rate_limited(Utc::now().timestamp() + 2, 0)));

    let request = OrderRequest::market("NEW_USDT", OrderSide::Buy, 200.0);
    let order = h
        .executor
        .execute_order(&request, &CancellationToken::new())
        .await
        .unwrap();

    let calls = h.exchange.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at.duration_since(calls[0].at) >= Duration::from_secs(1));
    assert_eq!(order.id, "1");
}

#[tokio::test]
async fn test_concurrency_gate_saturated() {
    let h = harness();
    h.exchange.set_place_delay(Duration::from_millis(300));
    let config = SniperConfig {
        max_concurrent_orders: 2,
        ..sniper_config()
    };
    let engine = running_engine(&h, config).await;

    let first = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute_snipe("NEW_USDT", &CancellationToken::new()).await }
    });
    let second = tokio::spawn({
        let engine = engine.clone();
        async move { engine.execute_snipe("NEW_USDT", &CancellationToken::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let third = engine
        .execute_snipe("NEW_USDT", &CancellationToken::new())
        .await;
    assert!(matches!(third, Err(TradingError::ConcurrencyLimit { limit: 2 })));

    assert_ok!(first.await.unwrap());
    assert_ok!(second.await.unwrap());
    assert_eq!(h.exchange.place_calls(), 2);
    assert_eq!(engine.in_flight(), 0);
}

#[tokio::test]
async fn test_in_flight_never_exceeds_limit() {
    let h = harness();
    h.exchange.set_place_delay(Duration::from_millis(100));
    let config = SniperConfig {
        max_concurrent_orders: 3,
        ..sniper_config()
    };
    let engine = running_engine(&h, config).await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let engine = engine.clone();
        tasks.spawn(async move { engine.execute_snipe("NEW_USDT", &CancellationToken::new()).await });
    }

    let mut placed = 0;
    let mut rejected = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => placed += 1,
            Err(TradingError::ConcurrencyLimit { limit: 3 }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(placed + rejected, 10);
    assert!(placed >= 3);
    assert!(h.exchange.peak_active() <= 3);
}

#[tokio::test]
async fn test_price_cache_avoids_ticker_calls() {
    let h = harness();
    let config = SniperConfig {
        price_cache_ttl: Duration::from_millis(400),
        ..sniper_config()
    };
    let engine = running_engine(&h, config).await;
    let cancel = CancellationToken::new();

    assert_ok!(engine.execute_snipe("NEW_USDT", &cancel).await);
    assert_ok!(engine.execute_snipe("NEW_USDT", &cancel).await);
    assert_eq!(h.market.ticker_calls(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_ok!(engine.execute_snipe("NEW_USDT", &cancel).await);
    assert_eq!(h.market.ticker_calls(), 2);
}

#[tokio::test]
async fn test_filled_snipe_places_exits_and_records_position() {
    let h = harness();
    let positions = Arc::new(InMemoryStore::new());
    let config = SniperConfig {
        enable_take_profit: true,
        take_profit_pct: 20.0,
        enable_stop_loss: true,
        stop_loss_pct: 10.0,
        ..sniper_config()
    };
    let engine = SniperEngine::with_position_store(
        h.executor.clone(),
        h.market.clone(),
        positions.clone(),
        config,
    )
    .unwrap();
    engine.start().await;

    engine
        .execute_snipe("NEW_USDT", &CancellationToken::new())
        .await
        .unwrap();
    engine.wait_for_post_trade().await;

    let calls = h.exchange.calls();
    assert_eq!(calls.len(), 3);
    let mut exits: Vec<_> = calls[1..].iter().map(|c| c.request.clone()).collect();
    exits.sort_by(|a, b| a.price.total_cmp(&b.price));
    assert!(exits.iter().all(|r| r.side == OrderSide::Sell && r.order_type == OrderType::Limit));
    assert!((exits[0].price - 0.45).abs() < 1e-9);
    assert!((exits[1].price - 0.6).abs() < 1e-9);

    let open = positions.list_open().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].symbol, "NEW_USDT");
    assert!((open[0].quantity - 200.0).abs() < 1e-9);
    // Both levels rest on the exchange and are tracked by order id
    assert!(!open[0].has_exit_levels());
    let mut resting: Vec<String> = open[0]
        .resting_exit_orders()
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    resting.sort();
    assert_eq!(resting, vec!["2".to_string(), "3".to_string()]);

    engine.stop().await;
}

#[tokio::test]
async fn test_resting_exit_fill_closes_position() {
    let h = harness();
    let positions = Arc::new(InMemoryStore::new());
    let config = SniperConfig {
        enable_take_profit: true,
        take_profit_pct: 20.0,
        enable_stop_loss: true,
        stop_loss_pct: 10.0,
        ..sniper_config()
    };
    let engine = SniperEngine::with_position_store(
        h.executor.clone(),
        h.market.clone(),
        positions.clone(),
        config,
    )
    .unwrap();
    engine.start().await;
    engine
        .execute_snipe("NEW_USDT", &CancellationToken::new())
        .await
        .unwrap();
    engine.wait_for_post_trade().await;
    engine.stop().await;

    let open = positions.list_open().await.unwrap();
    assert_eq!(open.len(), 1);
    let stop_loss_id = open[0].stop_loss_order_id.clone().unwrap();

    // The exchange reports every resting order as filled; stop-loss is polled first
    let monitor = PositionMonitor::new(positions.clone(), h.market.clone(), h.executor.clone());
    let closed = monitor
        .check_positions(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(closed, 1);

    let stored = PositionStore::get_by_id(positions.as_ref(), open[0].id)
        .await
        .unwrap();
    assert!(!stored.is_open());
    assert_eq!(stored.exit_order_ids, vec![stop_loss_id]);
    assert_eq!(stored.exit_price, Some(0.45));
    assert_eq!(h.exchange.cancel_calls(), 1);
    // No market exit on top of the filled leg
    assert_eq!(h.exchange.place_calls(), 3);
    assert!(positions.list_open().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_snipe_requires_running_engine() {
    let h = harness();
    let engine = SniperEngine::new(h.executor.clone(), h.market.clone(), sniper_config()).unwrap();

    let err = engine
        .execute_snipe("NEW_USDT", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TradingError::NotRunning));
    assert_eq!(h.exchange.place_calls(), 0);
}
