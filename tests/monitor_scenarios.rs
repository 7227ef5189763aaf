use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use snipebot::testing::{CountingPositions, ScriptedExchange, ScriptedMarket};
use snipebot::execution::{CheckOutcome, ExecutorConfig, PositionMonitor, RateLimitedExecutor};
use snipebot::models::{ExitReason, OrderSide, OrderType, Position, PositionStatus};
use snipebot::persistence::PositionStore;
use snipebot::sniper::{SniperConfig, SniperEngine, SniperStatus};

struct Harness {
    exchange: Arc<ScriptedExchange>,
    market: Arc<ScriptedMarket>,
    positions: Arc<CountingPositions>,
    monitor: PositionMonitor,
}

fn harness() -> Harness {
    let exchange = Arc::new(ScriptedExchange::new());
    let market = Arc::new(ScriptedMarket::new());
    let positions = Arc::new(CountingPositions::new());
    let executor = RateLimitedExecutor::new(exchange.clone(), ExecutorConfig::default()).unwrap();
    let monitor = PositionMonitor::new(positions.clone(), market.clone(), Arc::new(executor));

    Harness {
        exchange,
        market,
        positions,
        monitor,
    }
}

#[tokio::test]
async fn test_stop_loss_closes_long() {
    let h = harness();
    let position = Position::new_long("BTC_USDT", 10_000.0, 0.1, Some(9000.0), None).unwrap();
    h.positions.create(&position).await.unwrap();
    h.market.listing("BTC_USDT", 8900.0);

    let closed = h
        .monitor
        .check_positions(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(closed, 1);

    let calls = h.exchange.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].request.side, OrderSide::Sell);
    assert_eq!(calls[0].request.order_type, OrderType::Market);
    assert_eq!(calls[0].request.quantity, 0.1);

    assert_eq!(h.positions.close_calls(), 1);
    let stored = h.positions.get_by_id(position.id).await.unwrap();
    assert_eq!(stored.status, PositionStatus::Closed);
    assert_eq!(stored.exit_price, Some(8900.0));
    assert_eq!(stored.exit_order_ids, vec!["1".to_string()]);
}

#[tokio::test]
async fn test_take_profit_closes_short() {
    let h = harness();
    let position = Position::new_short("ETH_USDT", 2100.0, 1.0, None, Some(2000.0)).unwrap();
    h.positions.create(&position).await.unwrap();
    h.market.listing("ETH_USDT", 1900.0);

    let outcome = h
        .monitor
        .check_position(position.id, &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        CheckOutcome::Closed { reason, position } => {
            assert_eq!(reason, ExitReason::TakeProfit);
            assert_eq!(position.status, PositionStatus::Closed);
            assert_eq!(position.exit_price, Some(1900.0));
            assert!((position.pnl - 200.0).abs() < 1e-9);
        }
        other => panic!("expected close, got {other:?}"),
    }

    let calls = h.exchange.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].request.side, OrderSide::Buy);
    assert_eq!(calls[0].request.quantity, 1.0);
}

#[tokio::test]
async fn test_untriggered_position_held() {
    let h = harness();
    let position = Position::new_long("BTC_USDT", 10_000.0, 0.1, Some(9000.0), Some(11_000.0)).unwrap();
    h.positions.create(&position).await.unwrap();
    h.market.listing("BTC_USDT", 10_500.0);

    let closed = h
        .monitor
        .check_positions(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(closed, 0);
    assert_eq!(h.exchange.place_calls(), 0);
    let stored = h.positions.get_by_id(position.id).await.unwrap();
    assert!(stored.is_open());
    assert_eq!(stored.current_price, 10_500.0);
    assert!((stored.pnl - 50.0).abs() < 1e-9);
}

#[test]
fn test_trigger_truth_table() {
    let long = Position::new_long("BTC_USDT", 100.0, 1.0, Some(90.0), Some(120.0)).unwrap();
    let short = Position::new_short("BTC_USDT", 100.0, 1.0, Some(110.0), Some(80.0)).unwrap();

    // (price, long SL, long TP, short SL, short TP)
    let table = [
        (70.0, true, false, false, true),
        (80.0, true, false, false, true),
        (90.0, true, false, false, false),
        (100.0, false, false, false, false),
        (110.0, false, false, true, false),
        (120.0, false, true, true, false),
        (130.0, false, true, true, false),
    ];

    for (price, long_sl, long_tp, short_sl, short_tp) in table {
        assert_eq!(long.is_stop_loss_triggered(price), long_sl, "long SL @ {price}");
        assert_eq!(long.is_take_profit_triggered(price), long_tp, "long TP @ {price}");
        assert_eq!(short.is_stop_loss_triggered(price), short_sl, "short SL @ {price}");
        assert_eq!(short.is_take_profit_triggered(price), short_tp, "short TP @ {price}");
    }

    // Unset levels never trigger
    let bare = Position::new_long("BTC_USDT", 100.0, 1.0, None, None).unwrap();
    assert_eq!(bare.exit_trigger(0.0001), None);
    assert_eq!(bare.exit_trigger(1e9), None);
}

#[tokio::test]
async fn test_monitor_lifecycle_idempotent() {
    let mut h = harness();
    h.monitor.set_interval(Duration::from_millis(50));

    h.monitor.start().await;
    h.monitor.start().await;
    assert!(h.monitor.is_running().await);

    h.monitor.stop().await;
    h.monitor.stop().await;
    assert!(!h.monitor.is_running().await);

    h.monitor.start().await;
    assert!(h.monitor.is_running().await);
    h.monitor.stop().await;
}

#[tokio::test]
async fn test_sniper_lifecycle_idempotent() {
    let exchange = Arc::new(ScriptedExchange::new());
    let market = Arc::new(ScriptedMarket::new());
    let executor = Arc::new(
        RateLimitedExecutor::new(exchange.clone(), ExecutorConfig::default()).unwrap(),
    );
    let engine = SniperEngine::new(executor, market, SniperConfig::default()).unwrap();

    engine.start().await;
    engine.start().await;
    assert_eq!(engine.status().await, SniperStatus::Running);

    engine.stop().await;
    engine.stop().await;
    assert_eq!(engine.status().await, SniperStatus::Stopped);
}

#[tokio::test]
async fn test_scanner_closes_triggered_position() {
    let mut h = harness();
    let position = Position::new_long("BTC_USDT", 10_000.0, 0.1, Some(9000.0), None).unwrap();
    h.positions.create(&position).await.unwrap();
    h.market.listing("BTC_USDT", 8500.0);

    h.monitor.set_interval(Duration::from_millis(50));
    h.monitor.start().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.monitor.stop().await;

    assert_eq!(h.exchange.place_calls(), 1);
    assert_eq!(h.positions.close_calls(), 1);
    assert!(h.positions.list_open().await.unwrap().is_empty());
}
