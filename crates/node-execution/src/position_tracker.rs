//! 포지션 추적기.
//!
//! 일정 주기로 거래소의 포지션 목록을 조회하여 전체 스냅샷을 교체 발행합니다.
//! 구독자는 `watch` 채널로 항상 최신 스냅샷만 읽습니다.

use chrono::Utc;
use node_core::{PositionSnapshot, Telemetry};
use node_exchange::Exchange;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CORRELATION_ID: &str = "internal";

/// 포지션 추적기.
pub struct PositionTracker {
    exchange: Arc<dyn Exchange>,
    telemetry: Arc<dyn Telemetry>,
    interval: Duration,
    sender: watch::Sender<PositionSnapshot>,
}

impl PositionTracker {
    pub fn new(exchange: Arc<dyn Exchange>, telemetry: Arc<dyn Telemetry>, interval: Duration) -> Self {
        let (sender, _) = watch::channel(PositionSnapshot::default());
        Self {
            exchange,
            telemetry,
            interval,
            sender,
        }
    }

    /// 스냅샷 구독.
    pub fn subscribe(&self) -> watch::Receiver<PositionSnapshot> {
        self.sender.subscribe()
    }

    /// 가장 최근 스냅샷.
    pub fn latest(&self) -> PositionSnapshot {
        self.sender.borrow().clone()
    }

    /// 포지션을 한 번 조회하여 발행합니다.
    ///
    /// 조회 실패 시 빈 스냅샷을 발행하며 에러를 돌려주지 않습니다.
    pub async fn refresh(&self) -> PositionSnapshot {
        let now = Utc::now().timestamp_millis();
        let snapshot = match self.exchange.get_positions().await {
            Ok(positions) => {
                debug!(count = positions.len(), "Positions refreshed");
                PositionSnapshot::new(positions, now)
            }
            Err(e) => {
                self.telemetry.log_error(
                    CORRELATION_ID,
                    "Error refreshing positions",
                    Some(&json!({ "error": e.to_string() })),
                );
                PositionSnapshot::failed(now)
            }
        };

        self.sender.send_replace(snapshot.clone());
        snapshot
    }

    /// 종료 신호까지 주기적으로 갱신합니다.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "Position tracker started");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // 첫 틱은 즉시 발생하므로 건너뜀
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Position tracker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_core::{Asset, MemoryTelemetry, Side, TelemetryLevel};
    use node_exchange::{Operation, SimulatedExchange};
    use rust_decimal_macros::dec;

    async fn tracker() -> (Arc<SimulatedExchange>, Arc<MemoryTelemetry>, Arc<PositionTracker>) {
        let exchange = Arc::new(SimulatedExchange::new());
        exchange.set_price("BTC", dec!(50000)).await;
        exchange
            .submit_market_order(&Asset::new("BTC"), Side::Buy, dec!(0.01))
            .await
            .unwrap();
        let telemetry = Arc::new(MemoryTelemetry::new());
        let tracker = Arc::new(PositionTracker::new(
            exchange.clone(),
            telemetry.clone(),
            Duration::from_millis(3000),
        ));
        (exchange, telemetry, tracker)
    }

    #[tokio::test]
    async fn test_refresh_publishes_latest() {
        let (_exchange, _telemetry, tracker) = tracker().await;
        let mut rx = tracker.subscribe();

        tracker.refresh().await;

        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert!(snapshot.ok);
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(tracker.latest(), snapshot);
    }

    #[tokio::test]
    async fn test_failed_refresh_publishes_empty() {
        let (exchange, telemetry, tracker) = tracker().await;
        tracker.refresh().await;
        exchange.fail_next(Operation::Positions, 1).await;

        let snapshot = tracker.refresh().await;

        assert!(!snapshot.ok);
        assert!(snapshot.positions.is_empty());
        assert!(tracker.latest().positions.is_empty());
        assert_eq!(telemetry.count_containing(TelemetryLevel::Error, "Error refreshing positions"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failures() {
        let (exchange, telemetry, tracker) = tracker().await;
        exchange.fail_next(Operation::Positions, 1).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(tracker.clone().run(shutdown.clone()));

        // 첫 틱: 실패
        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(!tracker.latest().ok);

        // 두 번째 틱: 복구
        tokio::time::sleep(Duration::from_millis(3000)).await;
        let latest = tracker.latest();
        assert!(latest.ok);
        assert_eq!(latest.positions.len(), 1);
        assert_eq!(telemetry.count_containing(TelemetryLevel::Error, "Error refreshing positions"), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
