//! 명령 디스패처.
//!
//! 한 번의 호출 안에서 명령은 `created_timestamp` 오름차순으로 하나씩 처리됩니다.
//! 각 명령을 실행하기 전에 워터마크를 `created_timestamp + 1`로 올리므로,
//! 결과와 관계없이 같은 명령을 다시 가져오지 않습니다.
//!
//! `parent_id`가 있는 명령은 부모가 완료될 때까지 대기 목록에 보관됩니다.
//! 부모의 완료 이벤트는 성공/실패와 무관하게 발생합니다.

use node_core::{
    Asset, Command, CommandKind, NodeConfig, OpenPositionPayload, Telemetry,
};
use node_exchange::{with_retry, Exchange, RetryConfig};
use node_risk::StopLossSupervisor;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::command_source::CommandSource;
use crate::error::{ExecutionError, ExecutionResult};

const POSITION_NOT_CREATED: &str = "Position not created yet";

/// 디스패처 설정.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// 보호 손절 설정 재시도
    pub retry: RetryConfig,
    /// 페이로드에 손절 가격이 없을 때의 기본 비율 (%)
    pub default_stop_loss_pct: Decimal,
    /// 대기 명령 보관 기간
    pub held_ttl: Duration,
    /// 기억할 완료 명령 ID 수
    pub completed_memory: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            default_stop_loss_pct: Decimal::new(4, 0),
            held_ttl: Duration::from_secs(600),
            completed_memory: 1024,
        }
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            retry: RetryConfig::from_settings(&config.retry),
            default_stop_loss_pct: config.risk.default_stop_loss_pct,
            held_ttl: Duration::from_secs(config.commands.held_ttl_secs),
            completed_memory: config.commands.completed_memory,
        }
    }
}

/// 한 번의 `process_commands` 결과.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// 실행된 명령 ID (실행 순서)
    pub dispatched: Vec<String>,
    /// 실패한 명령 ID와 에러 메시지
    pub failed: Vec<(String, String)>,
    /// 실행 없이 건너뛴 명령 ID
    pub skipped: Vec<String>,
    /// 부모를 기다리며 보관된 명령 ID
    pub held: Vec<String>,
    /// 보관 기간이 지나 버려진 명령 ID
    pub evicted: Vec<String>,
}

impl DispatchReport {
    /// 성공적으로 실행된 명령 수.
    pub fn succeeded(&self) -> usize {
        self.dispatched.len() - self.failed.len() - self.skipped.len()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Executed,
    Skipped,
}

struct HeldCommand {
    command: Command,
    held_at: Instant,
}

#[derive(Default)]
struct DispatchState {
    held: Vec<HeldCommand>,
    completed: VecDeque<String>,
    completed_ids: HashSet<String>,
}

impl DispatchState {
    fn remember_completed(&mut self, id: &str, capacity: usize) {
        if capacity == 0 || self.completed_ids.contains(id) {
            return;
        }
        if self.completed.len() >= capacity {
            if let Some(oldest) = self.completed.pop_front() {
                self.completed_ids.remove(&oldest);
            }
        }
        self.completed.push_back(id.to_string());
        self.completed_ids.insert(id.to_string());
    }

    /// `parent_id`를 기다리던 명령을 꺼내 부모 ID를 지운 뒤 반환합니다.
    fn release_children(&mut self, parent_id: &str) -> Vec<Command> {
        let (released, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|h| h.command.parent_id.as_deref() == Some(parent_id));
        self.held = waiting;

        released
            .into_iter()
            .map(|h| {
                let mut command = h.command;
                command.parent_id = None;
                command
            })
            .collect()
    }
}

/// 명령 디스패처.
pub struct CommandDispatcher {
    source: Arc<CommandSource>,
    exchange: Arc<dyn Exchange>,
    supervisor: Arc<StopLossSupervisor>,
    telemetry: Arc<dyn Telemetry>,
    settings: DispatcherSettings,
    state: Mutex<DispatchState>,
    /// 분리 실행 중인 보호 손절 작업
    protective_stops: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandDispatcher {
    pub fn new(
        source: Arc<CommandSource>,
        exchange: Arc<dyn Exchange>,
        supervisor: Arc<StopLossSupervisor>,
        telemetry: Arc<dyn Telemetry>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            source,
            exchange,
            supervisor,
            telemetry,
            settings,
            state: Mutex::new(DispatchState::default()),
            protective_stops: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stops(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.protective_stops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn source(&self) -> &Arc<CommandSource> {
        &self.source
    }

    /// 부모를 기다리는 명령 ID 목록.
    pub fn held_ids(&self) -> Vec<String> {
        self.state().held.iter().map(|h| h.command.id.clone()).collect()
    }

    /// 아직 끝나지 않은 보호 손절 작업 수.
    pub fn pending_protective_stops(&self) -> usize {
        self.stops().iter().filter(|h| !h.is_finished()).count()
    }

    /// 진행 중인 보호 손절 작업이 모두 끝날 때까지 기다립니다.
    pub async fn wait_for_protective_stops(&self) {
        let handles = std::mem::take(&mut *self.stops());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Protective stop task aborted");
            }
        }
    }

    /// 새 명령을 가져와 처리합니다.
    pub async fn poll(&self, correlation_id: &str) -> ExecutionResult<DispatchReport> {
        let commands = self.source.fetch_new_commands(correlation_id).await?;
        Ok(self.process_commands(commands, correlation_id).await)
    }

    /// 명령 묶음을 순서대로 처리합니다.
    ///
    /// 개별 명령의 실패는 기록만 하고 다음 명령으로 넘어갑니다.
    pub async fn process_commands(&self, mut commands: Vec<Command>, correlation_id: &str) -> DispatchReport {
        let mut report = DispatchReport {
            evicted: self.evict_stale(correlation_id),
            ..Default::default()
        };

        commands.sort_by_key(|c| c.created_timestamp);

        for mut command in commands {
            self.source
                .advance_watermark(command.created_timestamp.saturating_add(1));

            if let Some(parent_id) = command.parent_id.clone() {
                if !self.hold_or_release(&mut command, &parent_id) {
                    self.telemetry.log_info(
                        correlation_id,
                        &format!("Command {} held until {} completes", command.id, parent_id),
                        None,
                    );
                    report.held.push(command.id);
                    continue;
                }
            }

            self.dispatch_chain(command, correlation_id, &mut report).await;
        }

        report
    }

    /// 부모가 이미 완료되었으면 `parent_id`를 지우고 `true`를 반환합니다.
    /// 아니면 대기 목록에 넣습니다 (같은 ID는 한 번만).
    fn hold_or_release(&self, command: &mut Command, parent_id: &str) -> bool {
        let mut state = self.state();
        if state.completed_ids.contains(parent_id) {
            command.parent_id = None;
            return true;
        }
        if state.held.iter().any(|h| h.command.id == command.id) {
            debug!(id = %command.id, "Command already held");
        } else {
            state.held.push(HeldCommand {
                command: command.clone(),
                held_at: Instant::now(),
            });
        }
        false
    }

    fn evict_stale(&self, correlation_id: &str) -> Vec<String> {
        let ttl = self.settings.held_ttl;
        let stale: Vec<Command> = {
            let mut state = self.state();
            let (stale, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.held)
                .into_iter()
                .partition(|h| h.held_at.elapsed() > ttl);
            state.held = fresh;
            stale.into_iter().map(|h| h.command).collect()
        };

        stale
            .into_iter()
            .map(|command| {
                self.telemetry.log_warn(
                    correlation_id,
                    &format!(
                        "Dropping command {}: parent {} did not complete in time",
                        command.id,
                        command.parent_id.as_deref().unwrap_or_default()
                    ),
                    Some(&command.to_json()),
                );
                command.id
            })
            .collect()
    }

    /// 명령을 실행하고, 완료로 풀려난 자식 명령을 이어서 실행합니다.
    async fn dispatch_chain(&self, command: Command, correlation_id: &str, report: &mut DispatchReport) {
        let mut queue = VecDeque::from([command]);

        while let Some(command) = queue.pop_front() {
            self.source
                .advance_watermark(command.created_timestamp.saturating_add(1));
            let correlation_id = command.correlation_id.clone().unwrap_or_else(|| correlation_id.to_string());

            self.telemetry.log_info(
                &correlation_id,
                &format!("Processing command: {} for coin: {}", command.command_type(), command.asset),
                Some(&command.to_json()),
            );

            report.dispatched.push(command.id.clone());
            let span = node_core::command_span!(
                "command",
                correlation_id,
                command.asset,
                command.command_type()
            );
            match self.execute(&command, &correlation_id).instrument(span).await {
                Ok(Disposition::Executed) => {
                    debug!(id = %command.id, kind = command.command_type(), "Command executed");
                }
                Ok(Disposition::Skipped) => report.skipped.push(command.id.clone()),
                Err(e) => {
                    warn!(id = %command.id, kind = command.command_type(), error = %e, "Command failed");
                    self.telemetry.log_error(
                        &correlation_id,
                        &format!("Command {} failed for {}", command.command_type(), command.asset),
                        Some(&json!({ "id": command.id, "error": e.to_string() })),
                    );
                    report.failed.push((command.id.clone(), e.to_string()));
                }
            }

            let children = {
                let mut state = self.state();
                state.remember_completed(&command.id, self.settings.completed_memory);
                state.release_children(&command.id)
            };
            if !children.is_empty() {
                info!(parent = %command.id, count = children.len(), "Releasing held commands");
            }
            queue.extend(children);
        }
    }

    async fn execute(&self, command: &Command, correlation_id: &str) -> ExecutionResult<Disposition> {
        let asset = &command.asset;

        match &command.kind {
            CommandKind::SetStopLoss { price } => {
                self.exchange.set_stop_loss(asset, *price).await?;
            }
            CommandKind::ClosePosition => {
                self.exchange.close_whole_position(asset).await?;
            }
            CommandKind::SetSoftStopLoss { price } => {
                self.supervisor.set_soft_stop_loss(asset.clone(), *price);
            }
            CommandKind::SetPnlStopLoss { threshold } => {
                self.supervisor.set_pnl_stop_loss(asset.clone(), *threshold);
            }
            CommandKind::OpenPosition(payload) => {
                self.open_position(asset, payload, correlation_id).await?;
            }
            CommandKind::SaveHistoricalPosition => {
                let history = self.exchange.get_positions_history().await?;
                self.telemetry.log_info(
                    correlation_id,
                    &format!("Fetched {} historical positions", history.len()),
                    Some(&json!(history)),
                );
            }
            CommandKind::RestoreCommonIdForPosition
            | CommandKind::UpdateOnchainData
            | CommandKind::RestoreDataFromOnchain => {
                self.telemetry.log_warn(
                    correlation_id,
                    &format!("Command {} has no effect on this node", command.command_type()),
                    Some(&command.to_json()),
                );
                return Ok(Disposition::Skipped);
            }
            CommandKind::Unknown { command_type } => {
                self.telemetry.log_warn(
                    correlation_id,
                    &format!("Unknown command type: {}", command_type),
                    Some(&command.to_json()),
                );
                return Ok(Disposition::Skipped);
            }
            CommandKind::Malformed { command_type, reason } => {
                self.telemetry.log_warn(
                    correlation_id,
                    &format!("Malformed {} command: {}", command_type, reason),
                    Some(&command.to_json()),
                );
                return Ok(Disposition::Skipped);
            }
        }

        Ok(Disposition::Executed)
    }

    async fn open_position(
        &self,
        asset: &Asset,
        payload: &OpenPositionPayload,
        correlation_id: &str,
    ) -> ExecutionResult<()> {
        let (wallet, price) = tokio::try_join!(
            self.exchange.get_wallet_balance(),
            self.exchange.get_price(asset)
        )?;

        let quantity = payload
            .quantity(wallet.available_amount, price)
            .ok_or_else(|| ExecutionError::InvalidOrder(format!("Invalid price {} for {}", price, asset)))?;

        self.exchange.set_leverage(asset, payload.leverage).await?;
        let quantity = self.exchange.normalize_quantity(asset, quantity).await?;
        if quantity <= Decimal::ZERO {
            return Err(ExecutionError::InvalidOrder(format!(
                "Order quantity for {} rounds to zero",
                asset
            )));
        }

        let order_id = self
            .exchange
            .submit_market_order(asset, payload.side, quantity)
            .await?;

        self.telemetry.log_info(
            correlation_id,
            &format!("Order placed for {}", asset),
            Some(&json!({
                "orderId": order_id,
                "side": payload.side,
                "quantity": quantity,
                "price": price,
                "leverage": payload.leverage,
            })),
        );

        let stop = payload.protective_stop(price, self.settings.default_stop_loss_pct);
        self.spawn_protective_stop(asset.clone(), stop, correlation_id.to_string());
        Ok(())
    }

    /// 포지션이 보일 때까지 재시도한 뒤 손절을 설정합니다.
    ///
    /// 호출자를 막지 않으며 결과는 텔레메트리로만 보고됩니다.
    fn spawn_protective_stop(&self, asset: Asset, stop: Decimal, correlation_id: String) {
        let exchange = self.exchange.clone();
        let telemetry = self.telemetry.clone();
        let retry = self.settings.retry.clone();

        let handle = tokio::spawn(async move {
            let (result, stats) = with_retry(&retry, || {
                let exchange = exchange.clone();
                let asset = asset.clone();
                async move {
                    let positions = exchange.get_positions().await.map_err(|e| e.to_string())?;
                    if !positions.iter().any(|p| p.asset == asset && p.is_open()) {
                        return Err(POSITION_NOT_CREATED.to_string());
                    }
                    exchange
                        .set_stop_loss(&asset, stop)
                        .await
                        .map_err(|e| e.to_string())
                }
            })
            .await;

            let summary = json!({
                "stopLoss": stop,
                "attempts": stats.attempts,
                "failures": stats.failures,
                "lastError": stats.last_error,
            });
            match result {
                Ok(()) => telemetry.log_info(
                    &correlation_id,
                    &format!("Stop loss set for {} at {}", asset, stop),
                    Some(&summary),
                ),
                Err(_) => telemetry.log_error(
                    &correlation_id,
                    &format!("Setting SL failed for {} after few attempts", asset),
                    Some(&summary),
                ),
            }
        });

        let mut stops = self.stops();
        stops.retain(|h| !h.is_finished());
        stops.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use node_core::{MemoryTelemetry, Side, TelemetryLevel};
    use node_exchange::{ExchangeCall, Operation, SimulatedExchange};
    use rust_decimal_macros::dec;

    use crate::coordinator::CommandFeed;

    struct EmptyFeed;

    #[async_trait]
    impl CommandFeed for EmptyFeed {
        async fn fetch_commands(&self, _watermark: i64, _correlation_id: &str) -> ExecutionResult<Vec<Command>> {
            Ok(vec![])
        }

        fn source(&self) -> &str {
            "empty"
        }
    }

    struct Fixture {
        exchange: Arc<SimulatedExchange>,
        telemetry: Arc<MemoryTelemetry>,
        supervisor: Arc<StopLossSupervisor>,
        dispatcher: CommandDispatcher,
    }

    fn fixture(settings: DispatcherSettings) -> Fixture {
        let exchange = Arc::new(SimulatedExchange::new());
        let telemetry = Arc::new(MemoryTelemetry::new());
        let supervisor = Arc::new(StopLossSupervisor::new(exchange.clone(), telemetry.clone(), 300_000));
        let source = Arc::new(CommandSource::with_watermark(Arc::new(EmptyFeed), telemetry.clone(), 0));
        let dispatcher = CommandDispatcher::new(
            source,
            exchange.clone(),
            supervisor.clone(),
            telemetry.clone(),
            settings,
        );
        Fixture {
            exchange,
            telemetry,
            supervisor,
            dispatcher,
        }
    }

    fn command(id: &str, ts: i64, kind: CommandKind) -> Command {
        Command {
            id: id.into(),
            parent_id: None,
            correlation_id: None,
            asset: Asset::new("BTC"),
            created_timestamp: ts,
            kind,
        }
    }

    fn child(id: &str, parent: &str, ts: i64, kind: CommandKind) -> Command {
        Command {
            parent_id: Some(parent.into()),
            ..command(id, ts, kind)
        }
    }

    #[tokio::test]
    async fn test_unsorted_batch_runs_in_order() {
        let f = fixture(DispatcherSettings::default());
        let batch = vec![
            command("c", 30, CommandKind::SetSoftStopLoss { price: dec!(3) }),
            command("a", 10, CommandKind::SetSoftStopLoss { price: dec!(1) }),
            command("b", 20, CommandKind::SetSoftStopLoss { price: dec!(2) }),
        ];

        let report = f.dispatcher.process_commands(batch, "corr").await;

        assert_eq!(report.dispatched, vec!["a", "b", "c"]);
        assert_eq!(f.dispatcher.source().watermark(), 31);
        // 마지막 명령이 이김
        let stop = f.supervisor.active_stop_loss(&Asset::new("BTC")).unwrap();
        assert_eq!(stop.threshold_price, dec!(3));
    }

    #[tokio::test]
    async fn test_watermark_advances_on_failure() {
        let f = fixture(DispatcherSettings::default());
        // 포지션이 없으므로 손절 설정 실패
        let batch = vec![command("sl", 1_700_000_000_000, CommandKind::SetStopLoss { price: dec!(40000) })];

        let report = f.dispatcher.process_commands(batch, "corr").await;

        assert_eq!(report.failed.len(), 1);
        assert_eq!(f.dispatcher.source().watermark(), 1_700_000_000_001);
        assert_eq!(f.telemetry.count_containing(TelemetryLevel::Error, "SET_STOP_LOSS failed"), 1);
    }

    #[tokio::test]
    async fn test_unknown_and_restore_are_skipped() {
        let f = fixture(DispatcherSettings::default());
        let batch = vec![
            command("u", 1, CommandKind::Unknown { command_type: "REBALANCE".into() }),
            command("r", 2, CommandKind::RestoreDataFromOnchain),
            command("p", 3, CommandKind::SetPnlStopLoss { threshold: Some(dec!(-50)) }),
        ];

        let report = f.dispatcher.process_commands(batch, "corr").await;

        assert_eq!(report.skipped, vec!["u", "r"]);
        assert_eq!(report.succeeded(), 1);
        assert_eq!(f.telemetry.count_containing(TelemetryLevel::Warn, "Unknown command type: REBALANCE"), 1);
        assert!(f.supervisor.pnl_stop_loss(&Asset::new("BTC")).is_some());
    }

    #[tokio::test]
    async fn test_child_waits_for_parent_in_same_batch() {
        let f = fixture(DispatcherSettings::default());
        let batch = vec![
            child("child", "parent", 5, CommandKind::SetPnlStopLoss { threshold: None }),
            command("parent", 10, CommandKind::SetSoftStopLoss { price: dec!(100) }),
        ];

        let report = f.dispatcher.process_commands(batch, "corr").await;

        assert_eq!(report.held, vec!["child"]);
        assert_eq!(report.dispatched, vec!["parent", "child"]);
        assert!(f.dispatcher.held_ids().is_empty());
    }

    #[tokio::test]
    async fn test_child_released_by_later_batch_exactly_once() {
        let f = fixture(DispatcherSettings::default());

        let first = f
            .dispatcher
            .process_commands(vec![child("child", "parent", 1, CommandKind::ClosePosition)], "corr")
            .await;
        assert_eq!(first.held, vec!["child"]);
        assert!(first.dispatched.is_empty());

        // 같은 자식이 다시 와도 중복 보관하지 않음
        f.dispatcher
            .process_commands(vec![child("child", "parent", 1, CommandKind::ClosePosition)], "corr")
            .await;
        assert_eq!(f.dispatcher.held_ids(), vec!["child"]);

        let second = f
            .dispatcher
            .process_commands(vec![command("parent", 2, CommandKind::ClosePosition)], "corr")
            .await;
        assert_eq!(second.dispatched, vec!["parent", "child"]);

        let closes = f
            .exchange
            .count_calls(|c| matches!(c, ExchangeCall::ClosePosition(..)))
            .await;
        assert_eq!(closes, 2);
    }

    #[tokio::test]
    async fn test_child_of_completed_parent_runs_immediately() {
        let f = fixture(DispatcherSettings::default());
        f.dispatcher
            .process_commands(vec![command("parent", 1, CommandKind::ClosePosition)], "corr")
            .await;

        let report = f
            .dispatcher
            .process_commands(vec![child("child", "parent", 2, CommandKind::ClosePosition)], "corr")
            .await;

        assert!(report.held.is_empty());
        assert_eq!(report.dispatched, vec!["child"]);
    }

    #[tokio::test]
    async fn test_grandchild_chain() {
        let f = fixture(DispatcherSettings::default());
        let batch = vec![
            child("b", "a", 1, CommandKind::ClosePosition),
            child("c", "b", 2, CommandKind::ClosePosition),
            command("a", 3, CommandKind::ClosePosition),
        ];

        let report = f.dispatcher.process_commands(batch, "corr").await;
        assert_eq!(report.dispatched, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_held_command_is_evicted() {
        let f = fixture(DispatcherSettings {
            held_ttl: Duration::from_secs(60),
            ..DispatcherSettings::default()
        });
        f.dispatcher
            .process_commands(vec![child("orphan", "ghost", 1, CommandKind::ClosePosition)], "corr")
            .await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = f.dispatcher.process_commands(vec![], "corr").await;

        assert_eq!(report.evicted, vec!["orphan"]);
        assert!(f.dispatcher.held_ids().is_empty());
        assert_eq!(f.telemetry.count_containing(TelemetryLevel::Warn, "Dropping command orphan"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_position_sizes_order_and_sets_stop() {
        let f = fixture(DispatcherSettings::default());
        f.exchange.set_wallet(dec!(1000), dec!(1200)).await;
        f.exchange.set_price("BTC", dec!(50000)).await;

        let open = CommandKind::OpenPosition(OpenPositionPayload {
            percentage: dec!(10),
            side: Side::Buy,
            leverage: dec!(5),
            stop_loss: None,
        });
        let report = f.dispatcher.process_commands(vec![command("o", 1, open)], "corr").await;
        assert!(report.failed.is_empty());

        let orders = f
            .exchange
            .count_calls(|c| {
                matches!(c, ExchangeCall::SubmitOrder { side: Side::Buy, quantity, .. } if *quantity == dec!(0.01))
            })
            .await;
        assert_eq!(orders, 1);
        assert_eq!(f.dispatcher.pending_protective_stops(), 1);

        f.dispatcher.wait_for_protective_stops().await;

        let position = f.exchange.position(&Asset::new("BTC")).await.unwrap();
        assert_eq!(position.stop_loss, Some(dec!(48000)));
        assert_eq!(position.leverage, dec!(5));
        assert_eq!(f.telemetry.count_containing(TelemetryLevel::Info, "Stop loss set for BTC"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protective_stop_does_not_block_next_command() {
        let f = fixture(DispatcherSettings::default());
        f.exchange.set_wallet(dec!(1000), dec!(1000)).await;
        f.exchange.set_price("BTC", dec!(50000)).await;
        f.exchange.set_visibility_delay(10).await;

        let open = CommandKind::OpenPosition(OpenPositionPayload {
            percentage: dec!(10),
            side: Side::Sell,
            leverage: dec!(5),
            stop_loss: Some(dec!(51000)),
        });
        let started = Instant::now();
        let report = f
            .dispatcher
            .process_commands(
                vec![
                    command("o", 1, open),
                    command("s", 2, CommandKind::SetSoftStopLoss { price: dec!(51500) }),
                ],
                "corr",
            )
            .await;

        assert_eq!(report.dispatched, vec!["o", "s"]);
        assert_eq!(started.elapsed(), Duration::ZERO);

        f.dispatcher.wait_for_protective_stops().await;
        assert_eq!(started.elapsed(), Duration::from_millis(24375));
        assert_eq!(
            f.telemetry
                .count_containing(TelemetryLevel::Error, "Setting SL failed for BTC after few attempts"),
            1
        );
    }

    #[tokio::test]
    async fn test_open_position_failure_is_reported() {
        let f = fixture(DispatcherSettings::default());
        f.exchange.set_wallet(dec!(1000), dec!(1000)).await;
        f.exchange.set_price("BTC", dec!(50000)).await;
        f.exchange.fail_next(Operation::Order, 1).await;

        let open = CommandKind::OpenPosition(OpenPositionPayload {
            percentage: dec!(10),
            side: Side::Buy,
            leverage: dec!(5),
            stop_loss: None,
        });
        let report = f.dispatcher.process_commands(vec![command("o", 1, open)], "corr").await;

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("simulated Order failure"));
        assert_eq!(f.dispatcher.pending_protective_stops(), 0);
    }

    #[tokio::test]
    async fn test_tiny_order_rejected_before_submit() {
        let f = fixture(DispatcherSettings::default());
        f.exchange.set_wallet(dec!(1), dec!(1)).await;
        f.exchange.set_price("BTC", dec!(50000)).await;

        let open = CommandKind::OpenPosition(OpenPositionPayload {
            percentage: dec!(1),
            side: Side::Buy,
            leverage: dec!(1),
            stop_loss: None,
        });
        let report = f.dispatcher.process_commands(vec![command("o", 1, open)], "corr").await;

        assert!(report.failed[0].1.contains("rounds to zero"));
        let submitted = f
            .exchange
            .count_calls(|c| matches!(c, ExchangeCall::SubmitOrder { .. }))
            .await;
        assert_eq!(submitted, 0);
    }
}
