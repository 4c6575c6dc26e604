//! 손절 감시자 통합 테스트 (시뮬레이션 거래소 사용).

use node_core::{Asset, MemoryTelemetry, Position, PositionSnapshot, Side, TelemetryLevel};
use node_exchange::{ExchangeCall, Operation, SimulatedExchange};
use node_risk::{CloseReason, StopLossSupervisor};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const DWELL: u64 = 300_000;

fn position(asset: &str, side: Side, price: Decimal, pnl: Decimal) -> Position {
    let asset = Asset::new(asset);
    Position {
        symbol: asset.symbol("USDT"),
        asset,
        side,
        price,
        avg_price: dec!(42000),
        size: dec!(0.1),
        pnl,
        leverage: dec!(5),
        stop_loss: None,
        take_profit: None,
        profit_percent: Decimal::ZERO,
        updated: 0,
        raw: serde_json::Value::Null,
    }
}

fn snapshot(positions: Vec<Position>, at: i64) -> PositionSnapshot {
    PositionSnapshot::new(positions, at)
}

struct Fixture {
    exchange: Arc<SimulatedExchange>,
    telemetry: Arc<MemoryTelemetry>,
    supervisor: Arc<StopLossSupervisor>,
}

async fn fixture() -> Fixture {
    let exchange = Arc::new(SimulatedExchange::new());
    exchange.set_price("BTC", dec!(39500)).await;
    exchange
        .seed_position(position("BTC", Side::Buy, dec!(39500), dec!(-250)))
        .await;

    let telemetry = Arc::new(MemoryTelemetry::new());
    let supervisor = Arc::new(StopLossSupervisor::new(
        exchange.clone(),
        telemetry.clone(),
        DWELL,
    ));

    Fixture {
        exchange,
        telemetry,
        supervisor,
    }
}

async fn close_calls(exchange: &SimulatedExchange, asset: &str) -> usize {
    let asset = Asset::new(asset);
    exchange
        .count_calls(|c| matches!(c, ExchangeCall::ClosePosition(a, None) if *a == asset))
        .await
}

#[tokio::test]
async fn test_soft_stop_closes_only_after_dwell_window() {
    let f = fixture().await;
    let btc = Asset::new("BTC");
    f.supervisor.set_soft_stop_loss(btc.clone(), dec!(40000));

    let t0 = 1_700_000_000_000;
    let breached = vec![position("BTC", Side::Buy, dec!(39500), dec!(-250))];

    let report = f.supervisor.on_snapshot(&snapshot(breached.clone(), t0), t0).await;
    assert!(report.closed.is_empty());
    assert_eq!(f.supervisor.active_stop_loss(&btc).unwrap().breach_timestamp, t0);

    let report = f
        .supervisor
        .on_snapshot(&snapshot(breached.clone(), t0 + 300_000), t0 + 300_000)
        .await;
    assert!(report.closed.is_empty());
    assert_eq!(close_calls(&f.exchange, "BTC").await, 0);

    let report = f
        .supervisor
        .on_snapshot(&snapshot(breached, t0 + 300_001), t0 + 300_001)
        .await;
    assert_eq!(report.closed, vec![(btc.clone(), CloseReason::SoftStop)]);
    assert_eq!(close_calls(&f.exchange, "BTC").await, 1);
    assert!(f.supervisor.active_stop_loss(&btc).is_none());
    assert!(f.exchange.position(&btc).await.is_none());
}

#[tokio::test]
async fn test_recovery_resets_breach() {
    let f = fixture().await;
    let btc = Asset::new("BTC");
    f.supervisor.set_soft_stop_loss(btc.clone(), dec!(40000));

    let t0 = 1_000_000;
    let low = vec![position("BTC", Side::Buy, dec!(39900), dec!(-10))];
    let recovered = vec![position("BTC", Side::Buy, dec!(40100), dec!(10))];

    f.supervisor.on_snapshot(&snapshot(low.clone(), t0), t0).await;
    f.supervisor
        .on_snapshot(&snapshot(recovered, t0 + 100_000), t0 + 100_000)
        .await;
    assert_eq!(f.supervisor.active_stop_loss(&btc).unwrap().breach_timestamp, 0);

    f.supervisor
        .on_snapshot(&snapshot(low.clone(), t0 + 200_000), t0 + 200_000)
        .await;
    let report = f
        .supervisor
        .on_snapshot(&snapshot(low, t0 + 300_001), t0 + 300_001)
        .await;

    assert!(report.closed.is_empty());
    assert_eq!(close_calls(&f.exchange, "BTC").await, 0);
    assert_eq!(
        f.supervisor.active_stop_loss(&btc).unwrap().breach_timestamp,
        t0 + 200_000
    );
}

#[tokio::test]
async fn test_short_breach_is_price_above_threshold() {
    let f = fixture().await;
    let eth = Asset::new("ETH");
    f.supervisor.set_soft_stop_loss(eth.clone(), dec!(2100));

    let short = vec![position("ETH", Side::Sell, dec!(2100), dec!(-5))];
    f.supervisor.on_snapshot(&snapshot(short.clone(), 0), 1).await;
    let report = f.supervisor.on_snapshot(&snapshot(short, 0), 300_002).await;

    assert_eq!(report.closed, vec![(eth, CloseReason::SoftStop)]);
}

#[tokio::test]
async fn test_pnl_stop_closes_immediately() {
    let f = fixture().await;
    let btc = Asset::new("BTC");
    f.supervisor.set_pnl_stop_loss(btc.clone(), Some(dec!(-50)));

    let report = f
        .supervisor
        .on_snapshot(
            &snapshot(vec![position("BTC", Side::Buy, dec!(41000), dec!(-75))], 5),
            5,
        )
        .await;

    assert_eq!(report.closed, vec![(btc.clone(), CloseReason::PnlStop)]);
    assert!(f.supervisor.pnl_stop_loss(&btc).is_none());
    assert_eq!(close_calls(&f.exchange, "BTC").await, 1);
    assert_eq!(f.telemetry.count_containing(TelemetryLevel::Info, "closed by pnl"), 1);
}

#[tokio::test]
async fn test_null_pnl_threshold_keeps_record_without_closing() {
    let f = fixture().await;
    let btc = Asset::new("BTC");
    f.supervisor.set_pnl_stop_loss(btc.clone(), None);

    let report = f
        .supervisor
        .on_snapshot(
            &snapshot(vec![position("BTC", Side::Buy, dec!(30000), dec!(-5000))], 5),
            5,
        )
        .await;

    assert!(report.closed.is_empty());
    assert!(f.supervisor.pnl_stop_loss(&btc).is_some());
}

#[tokio::test]
async fn test_entries_pruned_when_position_disappears() {
    let f = fixture().await;
    let eth = Asset::new("ETH");
    f.supervisor.set_soft_stop_loss(eth.clone(), dec!(1800));
    f.supervisor.set_pnl_stop_loss(eth.clone(), Some(dec!(-20)));

    let report = f
        .supervisor
        .on_snapshot(
            &snapshot(vec![position("BTC", Side::Buy, dec!(45000), dec!(10))], 1),
            1,
        )
        .await;

    assert_eq!(report.pruned, vec![eth.clone()]);
    assert!(f.supervisor.active_stop_loss(&eth).is_none());
    assert!(f.supervisor.pnl_stop_loss(&eth).is_none());
}

#[tokio::test]
async fn test_failed_close_is_retried_on_next_snapshot() {
    let f = fixture().await;
    let btc = Asset::new("BTC");
    f.supervisor.set_pnl_stop_loss(btc.clone(), Some(dec!(-50)));
    f.exchange.fail_next(Operation::Close, 1).await;

    let losing = vec![position("BTC", Side::Buy, dec!(39000), dec!(-300))];

    let report = f.supervisor.on_snapshot(&snapshot(losing.clone(), 1), 1).await;
    assert_eq!(report.failed.len(), 1);
    assert!(f.supervisor.pnl_stop_loss(&btc).is_some());
    assert_eq!(f.telemetry.count_containing(TelemetryLevel::Error, "failed"), 1);

    let report = f.supervisor.on_snapshot(&snapshot(losing, 2), 2).await;
    assert_eq!(report.closed, vec![(btc, CloseReason::PnlStop)]);
    assert_eq!(close_calls(&f.exchange, "BTC").await, 2);
}

#[tokio::test]
async fn test_failed_snapshot_prunes_all_entries() {
    let f = fixture().await;
    let btc = Asset::new("BTC");
    f.supervisor.set_soft_stop_loss(btc.clone(), dec!(40000));
    f.supervisor.set_pnl_stop_loss(btc.clone(), Some(dec!(-50)));

    let report = f.supervisor.on_snapshot(&PositionSnapshot::failed(1), 1).await;

    assert_eq!(report.pruned, vec![btc.clone()]);
    assert!(report.closed.is_empty());
    assert!(f.supervisor.active_stop_loss(&btc).is_none());
    assert!(f.supervisor.pnl_stop_loss(&btc).is_none());
    assert_eq!(close_calls(&f.exchange, "BTC").await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_consumes_snapshots_until_shutdown() {
    let f = fixture().await;
    let btc = Asset::new("BTC");
    f.supervisor.set_pnl_stop_loss(btc.clone(), Some(dec!(-50)));

    let (tx, rx) = watch::channel(PositionSnapshot::new(Vec::new(), 0));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(f.supervisor.clone().run(rx, shutdown.clone()));

    tx.send(snapshot(vec![position("BTC", Side::Buy, dec!(39000), dec!(-80))], 1))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(close_calls(&f.exchange, "BTC").await, 1);
    assert!(f.supervisor.pnl_stop_loss(&btc).is_none());

    shutdown.cancel();
    handle.await.unwrap();
}
