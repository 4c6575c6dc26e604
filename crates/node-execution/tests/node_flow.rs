//! 코디네이터 피드부터 거래소까지 노드 전체 흐름 테스트.

use async_trait::async_trait;
use mockito::{Matcher, Server};
use node_core::{Asset, Command, MemoryTelemetry, NodeConfig, Side, TelemetryLevel};
use node_exchange::{Exchange, ExchangeCall, SimulatedExchange};
use node_execution::{CommandFeed, ExecutionResult, TradingNode};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config(base_url: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.public_url = "https://node.example.com".into();
    config.node.nickname = "tester".into();
    config.coordinator.base_url = base_url.into();
    config.coordinator.subscribed_to = vec!["octo-1".into()];
    config.tracker.interval_ms = 20;
    config.retry.initial_interval_ms = 10;
    config
}

#[tokio::test]
async fn test_poll_executes_feed_commands() {
    let mut server = Server::new_async().await;
    let feed = server
        .mock("GET", Matcher::Regex(r"^/investing/customer-commands/\d+$".into()))
        .match_header("x-common-id", "poll-1")
        .with_status(200)
        .with_body(
            json!([
                {
                    "id": "open-1", "coin": "BTC", "type": "OPEN_POSITION",
                    "payload": {"percentage": 10, "side": "Buy", "leverage": 5},
                    "createdTimestamp": 4102444800002i64
                },
                {
                    "id": "soft-1", "parentId": "open-1", "coin": "BTC", "type": "SET_SOFT_STOP_LOSS",
                    "payload": {"price": 47000}, "createdTimestamp": 4102444800001i64
                },
                {
                    "id": "x-1", "coin": "BTC", "type": "MOVE_FUNDS", "payload": null,
                    "createdTimestamp": 4102444800003i64
                }
            ])
            .to_string(),
        )
        .create_async()
        .await;

    let exchange = Arc::new(SimulatedExchange::new());
    exchange.set_wallet(dec!(1000), dec!(1000)).await;
    exchange.set_price("BTC", dec!(50000)).await;
    let telemetry = Arc::new(MemoryTelemetry::new());

    let node = TradingNode::builder(config(&server.url()))
        .exchange(exchange.clone())
        .telemetry(telemetry.clone())
        .build()
        .unwrap();

    let report = node.trigger_poll("poll-1").await.unwrap();
    feed.assert_async().await;

    assert_eq!(report.held, vec!["soft-1"]);
    assert_eq!(report.dispatched, vec!["open-1", "soft-1", "x-1"]);
    assert_eq!(report.skipped, vec!["x-1"]);
    assert_eq!(node.dispatcher().source().watermark(), 4102444800004);

    let btc = Asset::new("BTC");
    let soft = node.supervisor().active_stop_loss(&btc).unwrap();
    assert_eq!(soft.threshold_price, dec!(47000));

    node.drain().await;
    let position = exchange.position(&btc).await.unwrap();
    assert_eq!(position.size, dec!(0.01));
    assert_eq!(position.stop_loss, Some(dec!(48000)));
    assert_eq!(telemetry.count_containing(TelemetryLevel::Warn, "Unknown command type: MOVE_FUNDS"), 1);
}

#[tokio::test]
async fn test_register_and_wallet_queries() {
    let mut server = Server::new_async().await;
    let register = server
        .mock("POST", "/customers/register")
        .match_body(Matcher::PartialJson(json!({
            "url": "https://node.example.com",
            "nickname": "tester",
            "subscribedTo": ["octo-1"]
        })))
        .with_status(200)
        .create_async()
        .await;

    let exchange = Arc::new(SimulatedExchange::new());
    exchange.set_wallet(dec!(750), dec!(1000)).await;
    exchange.set_price("ETH", dec!(3000)).await;

    let node = TradingNode::builder(config(&server.url()))
        .exchange(exchange)
        .telemetry(Arc::new(MemoryTelemetry::new()))
        .build()
        .unwrap();

    node.register("reg-1").await.unwrap();
    register.assert_async().await;

    assert_eq!(node.machine_id().len(), 6);
    assert_eq!(node.wallet_total().await.unwrap(), dec!(1000));
    assert_eq!(node.wallet_available().await.unwrap(), dec!(750));
    assert_eq!(node.price(&Asset::new("eth")).await.unwrap(), dec!(3000));
}

#[tokio::test]
async fn test_register_failure_is_reported() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/customers/register")
        .with_status(500)
        .with_body("boom")
        .create_async()
        .await;

    let telemetry = Arc::new(MemoryTelemetry::new());
    let node = TradingNode::builder(config(&server.url()))
        .exchange(Arc::new(SimulatedExchange::new()))
        .telemetry(telemetry.clone())
        .build()
        .unwrap();

    let err = node.register("reg-2").await.unwrap_err();
    assert_eq!(err.http_status(), 500);
    assert_eq!(telemetry.count_containing(TelemetryLevel::Error, "Registering failed"), 1);
}

/// 한 번만 명령을 돌려주는 피드.
struct OnceFeed {
    commands: Mutex<Vec<Command>>,
}

#[async_trait]
impl CommandFeed for OnceFeed {
    async fn fetch_commands(&self, _watermark: i64, _correlation_id: &str) -> ExecutionResult<Vec<Command>> {
        Ok(std::mem::take(&mut *self.commands.lock().unwrap()))
    }

    fn source(&self) -> &str {
        "once"
    }
}

#[tokio::test]
async fn test_started_node_closes_on_pnl_stop() {
    let exchange = Arc::new(SimulatedExchange::new());
    exchange.set_price("BTC", dec!(50000)).await;
    exchange
        .submit_market_order(&Asset::new("BTC"), Side::Buy, dec!(0.01))
        .await
        .unwrap();

    let pnl_stop = Command::from_wire(
        json!({
            "id": "pnl-1", "coin": "BTC", "type": "SET_PNL_STOP_LOSS",
            "payload": {"threshold": -50}, "createdTimestamp": 1
        }),
        0,
    );
    let telemetry = Arc::new(MemoryTelemetry::new());
    let node = TradingNode::builder(config("http://127.0.0.1:9"))
        .exchange(exchange.clone())
        .telemetry(telemetry.clone())
        .feed(Arc::new(OnceFeed {
            commands: Mutex::new(vec![pnl_stop]),
        }))
        .build()
        .unwrap();

    node.trigger_poll("poll-2").await.unwrap();
    assert!(node.supervisor().pnl_stop_loss(&Asset::new("BTC")).is_some());

    let shutdown = CancellationToken::new();
    let tasks = node.start(shutdown.clone());

    // pnl = (42500 - 50000) * 0.01 = -75
    exchange.set_price("BTC", dec!(42500)).await;

    let mut closed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if exchange.position(&Asset::new("BTC")).await.is_none() {
            closed = true;
            break;
        }
    }

    shutdown.cancel();
    tasks.join().await;

    assert!(closed);
    let closes = exchange
        .count_calls(|c| matches!(c, ExchangeCall::ClosePosition(..)))
        .await;
    assert_eq!(closes, 1);
    assert_eq!(telemetry.count_containing(TelemetryLevel::Info, "closed by pnl stop loss"), 1);
}
