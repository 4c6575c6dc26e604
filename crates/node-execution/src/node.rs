//! 트레이딩 노드.
//!
//! 컨트롤러 계층이 사용하는 노드 작업을 한곳에 모읍니다:
//! 폴링 트리거, 가격/잔고/포지션 조회, 코디네이터 등록, 머신 ID.

use node_core::{
    machine_id, Asset, ExchangeSettings, NodeConfig, NodeError, NodeResult, Position, Telemetry,
    TracingTelemetry,
};
use node_exchange::{BingxClient, BingxConfig, BybitClient, BybitConfig, Exchange, SimulatedExchange};
use node_risk::StopLossSupervisor;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::command_source::CommandSource;
use crate::coordinator::{CommandFeed, CoordinatorClient, Registration};
use crate::dispatcher::{CommandDispatcher, DispatchReport, DispatcherSettings};
use crate::position_tracker::PositionTracker;

/// 설정의 `exchange.venue`에 맞는 거래소 어댑터를 만듭니다.
pub fn create_exchange(settings: &ExchangeSettings) -> NodeResult<Arc<dyn Exchange>> {
    match settings.venue.as_str() {
        "simulated" => Ok(Arc::new(SimulatedExchange::new())),
        "bybit" => {
            let client = BybitClient::new(BybitConfig::from_settings(settings))?;
            Ok(Arc::new(client))
        }
        "bingx" => {
            let client = BingxClient::new(BingxConfig::from_settings(settings))?;
            Ok(Arc::new(client))
        }
        other => Err(NodeError::Config(format!("Unknown exchange venue: {}", other))),
    }
}

/// 노드 빌더.
pub struct TradingNodeBuilder {
    config: NodeConfig,
    exchange: Option<Arc<dyn Exchange>>,
    telemetry: Option<Arc<dyn Telemetry>>,
    feed: Option<Arc<dyn CommandFeed>>,
}

impl TradingNodeBuilder {
    /// 거래소 어댑터를 직접 지정합니다.
    pub fn exchange(mut self, exchange: Arc<dyn Exchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// 명령 피드를 직접 지정합니다. 기본값은 코디네이터 클라이언트입니다.
    pub fn feed(mut self, feed: Arc<dyn CommandFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn build(self) -> NodeResult<TradingNode> {
        let config = self.config;
        let machine_id = machine_id(&config.node.public_url);

        let exchange = match self.exchange {
            Some(exchange) => exchange,
            None => create_exchange(&config.exchange)?,
        };
        let telemetry = self.telemetry.unwrap_or_else(|| {
            Arc::new(TracingTelemetry::new(
                config.node.application_name.clone(),
                machine_id.clone(),
            ))
        });

        let coordinator = CoordinatorClient::new(&config.coordinator)?.with_machine_id(machine_id.clone());
        let feed = self
            .feed
            .unwrap_or_else(|| Arc::new(coordinator.clone()) as Arc<dyn CommandFeed>);

        let supervisor = Arc::new(StopLossSupervisor::new(
            exchange.clone(),
            telemetry.clone(),
            config.risk.dwell_window_ms,
        ));
        let tracker = Arc::new(PositionTracker::new(
            exchange.clone(),
            telemetry.clone(),
            Duration::from_millis(config.tracker.interval_ms),
        ));
        let source = Arc::new(CommandSource::new(feed, telemetry.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            source,
            exchange.clone(),
            supervisor.clone(),
            telemetry.clone(),
            DispatcherSettings::from_config(&config),
        ));

        info!(
            venue = exchange.name(),
            machine_id = %machine_id,
            "Trading node built"
        );

        Ok(TradingNode {
            config,
            machine_id,
            exchange,
            telemetry,
            coordinator,
            supervisor,
            tracker,
            dispatcher,
        })
    }
}

/// 실행 중인 백그라운드 작업.
pub struct NodeTasks {
    pub tracker: JoinHandle<()>,
    pub supervisor: JoinHandle<()>,
}

impl NodeTasks {
    /// 두 작업이 끝날 때까지 기다립니다.
    pub async fn join(self) {
        let (tracker, supervisor) = tokio::join!(self.tracker, self.supervisor);
        if let Err(e) = tracker {
            tracing::error!(error = %e, "Position tracker task failed");
        }
        if let Err(e) = supervisor {
            tracing::error!(error = %e, "Stop-loss supervisor task failed");
        }
    }
}

/// 원격 명령 기반 트레이딩 노드.
pub struct TradingNode {
    config: NodeConfig,
    machine_id: String,
    exchange: Arc<dyn Exchange>,
    telemetry: Arc<dyn Telemetry>,
    coordinator: CoordinatorClient,
    supervisor: Arc<StopLossSupervisor>,
    tracker: Arc<PositionTracker>,
    dispatcher: Arc<CommandDispatcher>,
}

impl TradingNode {
    pub fn builder(config: NodeConfig) -> TradingNodeBuilder {
        TradingNodeBuilder {
            config,
            exchange: None,
            telemetry: None,
            feed: None,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// 로컬 머신 식별자.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn exchange(&self) -> &Arc<dyn Exchange> {
        &self.exchange
    }

    pub fn supervisor(&self) -> &Arc<StopLossSupervisor> {
        &self.supervisor
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// 포지션 추적기와 손절 감시자를 시작합니다.
    pub fn start(&self, shutdown: CancellationToken) -> NodeTasks {
        let snapshots = self.tracker.subscribe();
        NodeTasks {
            tracker: tokio::spawn(self.tracker.clone().run(shutdown.clone())),
            supervisor: tokio::spawn(self.supervisor.clone().run(snapshots, shutdown)),
        }
    }

    /// 폴링 한 주기를 실행합니다: 새 명령을 가져와 처리합니다.
    pub async fn trigger_poll(&self, correlation_id: &str) -> NodeResult<DispatchReport> {
        Ok(self.dispatcher.poll(correlation_id).await?)
    }

    /// 자산의 현재 가격.
    pub async fn price(&self, asset: &Asset) -> NodeResult<Decimal> {
        Ok(self.exchange.get_price(asset).await?)
    }

    /// 총 자산.
    pub async fn wallet_total(&self) -> NodeResult<Decimal> {
        Ok(self.exchange.get_wallet_balance().await?.total_amount)
    }

    /// 주문 가능 금액.
    pub async fn wallet_available(&self) -> NodeResult<Decimal> {
        Ok(self.exchange.get_wallet_balance().await?.available_amount)
    }

    /// 포지션 추적기의 최신 스냅샷.
    pub fn positions(&self) -> Vec<Position> {
        self.tracker.latest().positions
    }

    /// 포지션을 즉시 다시 조회합니다.
    pub async fn refresh_positions(&self) -> Vec<Position> {
        self.tracker.refresh().await.positions
    }

    /// 코디네이터에 노드를 등록합니다.
    pub async fn register(&self, correlation_id: &str) -> NodeResult<()> {
        self.telemetry.log_info(
            correlation_id,
            &format!("Registering Customer: {}", self.machine_id),
            None,
        );

        let registration = Registration::from_settings(&self.config.node, &self.config.coordinator, &self.machine_id);
        match self.coordinator.register(&registration, correlation_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.telemetry.log_error(
                    correlation_id,
                    "Registering failed",
                    Some(&serde_json::json!({ "error": e.to_string() })),
                );
                Err(e.into())
            }
        }
    }

    /// 분리 실행 중인 보호 손절 작업이 끝날 때까지 기다립니다.
    pub async fn drain(&self) {
        self.dispatcher.wait_for_protective_stops().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_exchange_selects_venue() {
        let mut settings = ExchangeSettings::default();
        assert_eq!(create_exchange(&settings).unwrap().name(), "simulated");

        settings.api_key = "key".into();
        settings.api_secret = "secret".into();
        settings.venue = "bybit".into();
        assert_eq!(create_exchange(&settings).unwrap().name(), "bybit");

        settings.venue = "bingx".into();
        assert_eq!(create_exchange(&settings).unwrap().name(), "bingx");

        settings.venue = "kraken".into();
        assert!(matches!(create_exchange(&settings), Err(NodeError::Config(_))));
    }
}
