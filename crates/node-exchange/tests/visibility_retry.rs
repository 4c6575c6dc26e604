//! 주문 직후 포지션이 늦게 보이는 거래소에 대해 재시도 실행기를 검증합니다.

use node_core::{Asset, Side};
use node_exchange::{with_retry, Exchange, Operation, RetryConfig, SimulatedExchange};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

async fn wait_for_position(
    exchange: Arc<SimulatedExchange>,
    asset: Asset,
) -> (Result<(), String>, node_exchange::RetryStats) {
    with_retry(&RetryConfig::default(), || {
        let exchange = exchange.clone();
        let asset = asset.clone();
        async move {
            let positions = exchange.get_positions().await.map_err(|e| e.to_string())?;
            if positions.iter().any(|p| p.asset == asset) {
                Ok(())
            } else {
                Err("Position not created yet".to_string())
            }
        }
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_position_becomes_visible_on_third_poll() {
    let exchange = Arc::new(SimulatedExchange::new());
    let btc = Asset::new("BTC");
    exchange.set_price("BTC", dec!(50000)).await;
    exchange.set_visibility_delay(2).await;
    exchange.submit_market_order(&btc, Side::Buy, dec!(0.01)).await.unwrap();

    let (result, stats) = wait_for_position(exchange.clone(), btc).await;

    assert!(result.is_ok());
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.failures, 2);
    assert_eq!(stats.delays_ms, vec![3000, 4500, 6750]);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failures_count_against_budget() {
    let exchange = Arc::new(SimulatedExchange::new());
    exchange.fail_next(Operation::Positions, 10).await;

    let started = tokio::time::Instant::now();
    let (result, stats) = wait_for_position(exchange, Asset::new("ETH")).await;

    assert!(result.unwrap_err().contains("simulated Positions failure"));
    assert_eq!(stats.attempts, 4);
    assert!(!stats.succeeded);
    assert_eq!(started.elapsed(), Duration::from_millis(24375));
}
