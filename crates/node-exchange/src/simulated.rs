//! 시뮬레이션 거래소 구현.
//!
//! 실제 거래소 없이 노드를 실행하거나 테스트할 때 사용합니다.
//! 가격/잔고 설정, 포지션 시딩, 작업별 실패 주입, 포지션 노출 지연,
//! 호출 기록을 지원합니다.

use async_trait::async_trait;
use chrono::Utc;
use node_core::{Asset, ClosedPosition, Position, Side, WalletBalance, DEFAULT_QUOTE};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::traits::{floor_to_step, Exchange, ExchangeResult};
use crate::ExchangeError;

/// 실패 주입 대상 작업.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Price,
    Wallet,
    Positions,
    History,
    Leverage,
    Normalize,
    Order,
    StopLoss,
    Close,
}

/// 기록된 거래소 호출.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeCall {
    GetPrice(Asset),
    GetWallet,
    GetPositions,
    GetHistory,
    SetLeverage(Asset, Decimal),
    Normalize(Asset, Decimal),
    SubmitOrder {
        asset: Asset,
        side: Side,
        quantity: Decimal,
    },
    SetStopLoss(Asset, Decimal),
    ClosePosition(Asset, Option<Decimal>),
}

/// 아직 조회에 나타나지 않는 포지션.
#[derive(Debug, Clone)]
struct PendingPosition {
    position: Position,
    /// 노출까지 남은 포지션 조회 횟수
    remaining_polls: u32,
}

#[derive(Debug, Default)]
struct SimState {
    prices: HashMap<Asset, Decimal>,
    wallet: Option<WalletBalance>,
    positions: HashMap<Asset, Position>,
    pending: Vec<PendingPosition>,
    history: Vec<ClosedPosition>,
    leverage: HashMap<Asset, Decimal>,
    qty_steps: HashMap<Asset, Decimal>,
    /// 작업별 남은 실패 횟수
    failures: HashMap<Operation, u32>,
    visibility_delay: u32,
    journal: Vec<ExchangeCall>,
    next_order_id: u64,
}

impl SimState {
    fn check_failure(&mut self, op: Operation) -> ExchangeResult<()> {
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ExchangeError::NetworkError(format!(
                    "simulated {:?} failure",
                    op
                )));
            }
        }
        Ok(())
    }

    fn price_of(&self, asset: &Asset) -> ExchangeResult<Decimal> {
        self.prices
            .get(asset)
            .copied()
            .ok_or_else(|| ExchangeError::ApiError {
                code: 10001,
                message: format!("Invalid price received for {}", asset.symbol(DEFAULT_QUOTE)),
            })
    }

    /// 대기 중인 포지션을 한 단계 진행시키고 노출된 것을 반영합니다.
    fn advance_pending(&mut self) {
        let mut still_pending = Vec::new();
        for mut pending in std::mem::take(&mut self.pending) {
            if pending.remaining_polls == 0 {
                let asset = pending.position.asset.clone();
                self.positions.insert(asset, pending.position);
            } else {
                pending.remaining_polls -= 1;
                still_pending.push(pending);
            }
        }
        self.pending = still_pending;
    }

    fn apply_fill(&mut self, asset: &Asset, side: Side, quantity: Decimal, price: Decimal) {
        let leverage = self.leverage.get(asset).copied().unwrap_or(Decimal::ONE);

        match self.positions.get_mut(asset) {
            Some(position) if position.side == side => {
                let notional = position.avg_price * position.size + price * quantity;
                position.size += quantity;
                position.avg_price = notional / position.size;
                reprice(position, price);
            }
            Some(position) => {
                if quantity >= position.size {
                    let remainder = quantity - position.size;
                    let closed = self.positions.remove(asset);
                    if let Some(closed) = closed {
                        self.record_close(&closed, price);
                    }
                    if remainder > Decimal::ZERO {
                        let opened = new_position(asset, side, remainder, price, leverage);
                        self.positions.insert(asset.clone(), opened);
                    }
                } else {
                    position.size -= quantity;
                    reprice(position, price);
                }
            }
            None => {
                let opened = new_position(asset, side, quantity, price, leverage);
                if self.visibility_delay > 0 {
                    self.pending.push(PendingPosition {
                        position: opened,
                        remaining_polls: self.visibility_delay,
                    });
                } else {
                    self.positions.insert(asset.clone(), opened);
                }
            }
        }
    }

    fn record_close(&mut self, position: &Position, exit_price: Decimal) {
        let direction = match position.side {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        };
        self.history.push(ClosedPosition {
            asset: position.asset.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            size: position.size,
            avg_entry_price: position.avg_price,
            avg_exit_price: exit_price,
            closed_pnl: (exit_price - position.avg_price) * position.size * direction,
            leverage: position.leverage,
            closed_at: Utc::now().timestamp_millis(),
        });
    }
}

fn new_position(asset: &Asset, side: Side, size: Decimal, price: Decimal, leverage: Decimal) -> Position {
    Position {
        asset: asset.clone(),
        symbol: asset.symbol(DEFAULT_QUOTE),
        side,
        price,
        avg_price: price,
        size,
        pnl: Decimal::ZERO,
        leverage,
        stop_loss: None,
        take_profit: None,
        profit_percent: Decimal::ZERO,
        updated: Utc::now().timestamp_millis(),
        raw: serde_json::Value::Null,
    }
}

/// 마크 가격을 갱신하고 손익을 다시 계산합니다.
fn reprice(position: &mut Position, price: Decimal) {
    position.price = price;
    let diff = match position.side {
        Side::Buy => price - position.avg_price,
        Side::Sell => position.avg_price - price,
    };
    position.pnl = diff * position.size;
    position.profit_percent =
        Position::leveraged_percent_change(position.avg_price, price, position.side, position.leverage)
            .unwrap_or(Decimal::ZERO);
    position.updated = Utc::now().timestamp_millis();
}

/// 시뮬레이션 거래소.
#[derive(Debug, Default)]
pub struct SimulatedExchange {
    state: RwLock<SimState>,
}

impl SimulatedExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// 자산 가격을 설정합니다. 해당 자산의 포지션은 새 가격으로 재평가됩니다.
    pub async fn set_price(&self, asset: impl Into<Asset>, price: Decimal) {
        let asset = asset.into();
        let mut state = self.state.write().await;
        if let Some(position) = state.positions.get_mut(&asset) {
            reprice(position, price);
        }
        state.prices.insert(asset, price);
    }

    /// 지갑 잔고를 설정합니다.
    pub async fn set_wallet(&self, available_amount: Decimal, total_amount: Decimal) {
        self.state.write().await.wallet = Some(WalletBalance {
            available_amount,
            total_amount,
        });
    }

    /// 자산의 수량 단위를 설정합니다 (기본값 0.001).
    pub async fn set_qty_step(&self, asset: impl Into<Asset>, step: Decimal) {
        self.state.write().await.qty_steps.insert(asset.into(), step);
    }

    /// 포지션을 그대로 추가합니다.
    pub async fn seed_position(&self, position: Position) {
        let mut state = self.state.write().await;
        state.positions.insert(position.asset.clone(), position);
    }

    /// 새로 열린 포지션이 `polls`번의 조회 동안 보이지 않도록 합니다.
    pub async fn set_visibility_delay(&self, polls: u32) {
        self.state.write().await.visibility_delay = polls;
    }

    /// 다음 `times`번의 `op` 호출을 실패시킵니다.
    pub async fn fail_next(&self, op: Operation, times: u32) {
        self.state.write().await.failures.insert(op, times);
    }

    /// 실패 주입을 해제합니다.
    pub async fn clear_failures(&self) {
        self.state.write().await.failures.clear();
    }

    /// 지금까지의 호출 기록.
    pub async fn journal(&self) -> Vec<ExchangeCall> {
        self.state.read().await.journal.clone()
    }

    /// 조건에 맞는 호출 수.
    pub async fn count_calls(&self, predicate: impl Fn(&ExchangeCall) -> bool) -> usize {
        self.state.read().await.journal.iter().filter(|c| predicate(c)).count()
    }

    /// 현재 보이는 포지션 (조회 기록 없이).
    pub async fn position(&self, asset: &Asset) -> Option<Position> {
        self.state.read().await.positions.get(asset).cloned()
    }
}

#[async_trait]
impl Exchange for SimulatedExchange {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn get_price(&self, asset: &Asset) -> ExchangeResult<Decimal> {
        let mut state = self.state.write().await;
        state.journal.push(ExchangeCall::GetPrice(asset.clone()));
        state.check_failure(Operation::Price)?;
        state.price_of(asset)
    }

    async fn get_wallet_balance(&self) -> ExchangeResult<WalletBalance> {
        let mut state = self.state.write().await;
        state.journal.push(ExchangeCall::GetWallet);
        state.check_failure(Operation::Wallet)?;
        state
            .wallet
            .ok_or_else(|| ExchangeError::ParseError("Invalid wallet balance response.".into()))
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        let mut state = self.state.write().await;
        state.journal.push(ExchangeCall::GetPositions);
        state.check_failure(Operation::Positions)?;
        state.advance_pending();

        let mut positions: Vec<Position> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_positions_history(&self) -> ExchangeResult<Vec<ClosedPosition>> {
        let mut state = self.state.write().await;
        state.journal.push(ExchangeCall::GetHistory);
        state.check_failure(Operation::History)?;

        let since = Utc::now().timestamp_millis() - 60 * 60_000;
        Ok(state
            .history
            .iter()
            .filter(|c| c.closed_at >= since)
            .cloned()
            .collect())
    }

    async fn set_leverage(&self, asset: &Asset, leverage: Decimal) -> ExchangeResult<()> {
        let mut state = self.state.write().await;
        state.journal.push(ExchangeCall::SetLeverage(asset.clone(), leverage));
        state.check_failure(Operation::Leverage)?;
        state.leverage.insert(asset.clone(), leverage);
        Ok(())
    }

    async fn normalize_quantity(&self, asset: &Asset, quantity: Decimal) -> ExchangeResult<Decimal> {
        let mut state = self.state.write().await;
        state.journal.push(ExchangeCall::Normalize(asset.clone(), quantity));
        state.check_failure(Operation::Normalize)?;

        let step = state.qty_steps.get(asset).copied().unwrap_or(dec!(0.001));
        Ok(floor_to_step(quantity, step))
    }

    async fn submit_market_order(
        &self,
        asset: &Asset,
        side: Side,
        quantity: Decimal,
    ) -> ExchangeResult<String> {
        let mut state = self.state.write().await;
        state.journal.push(ExchangeCall::SubmitOrder {
            asset: asset.clone(),
            side,
            quantity,
        });
        state.check_failure(Operation::Order)?;

        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidQuantity(format!(
                "Qty invalid: {}",
                quantity
            )));
        }

        let price = state.price_of(asset)?;
        state.apply_fill(asset, side, quantity, price);
        state.next_order_id += 1;

        debug!(%asset, %side, %quantity, %price, "Simulated market order filled");
        Ok(format!("sim-{}", state.next_order_id))
    }

    async fn set_stop_loss(&self, asset: &Asset, price: Decimal) -> ExchangeResult<()> {
        let mut state = self.state.write().await;
        state.journal.push(ExchangeCall::SetStopLoss(asset.clone(), price));
        state.check_failure(Operation::StopLoss)?;

        match state.positions.get_mut(asset) {
            Some(position) => {
                position.stop_loss = Some(price);
                Ok(())
            }
            None => Err(ExchangeError::PositionNotFound(asset.symbol(DEFAULT_QUOTE))),
        }
    }

    async fn close_position(&self, asset: &Asset, quantity: Option<Decimal>) -> ExchangeResult<()> {
        let mut state = self.state.write().await;
        state.journal.push(ExchangeCall::ClosePosition(asset.clone(), quantity));
        state.check_failure(Operation::Close)?;

        let Some(position) = state.positions.get(asset).cloned() else {
            debug!(%asset, "No position to close");
            return Ok(());
        };

        let size = quantity.unwrap_or(position.size).min(position.size);
        let price = state.prices.get(asset).copied().unwrap_or(position.price);
        state.apply_fill(asset, position.side.opposite(), size, price);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> Asset {
        Asset::new("BTC")
    }

    #[tokio::test]
    async fn test_order_opens_and_close_flattens() {
        let exchange = SimulatedExchange::new();
        exchange.set_price("BTC", dec!(50000)).await;
        exchange.set_leverage(&btc(), dec!(5)).await.unwrap();

        exchange.submit_market_order(&btc(), Side::Buy, dec!(0.01)).await.unwrap();
        let positions = exchange.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(0.01));
        assert_eq!(positions[0].leverage, dec!(5));

        exchange.set_price("BTC", dec!(49000)).await;
        let position = exchange.position(&btc()).await.unwrap();
        assert_eq!(position.pnl, dec!(-10));

        exchange.close_whole_position(&btc()).await.unwrap();
        assert!(exchange.get_positions().await.unwrap().is_empty());
        assert_eq!(exchange.get_positions_history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_flat_is_noop() {
        let exchange = SimulatedExchange::new();
        exchange.close_whole_position(&btc()).await.unwrap();
        assert_eq!(
            exchange.journal().await,
            vec![ExchangeCall::ClosePosition(btc(), None)]
        );
    }

    #[tokio::test]
    async fn test_partial_close() {
        let exchange = SimulatedExchange::new();
        exchange.set_price("ETH", dec!(2000)).await;
        let eth = Asset::new("ETH");
        exchange.submit_market_order(&eth, Side::Sell, dec!(2)).await.unwrap();
        exchange.close_position(&eth, Some(dec!(0.5))).await.unwrap();

        let position = exchange.position(&eth).await.unwrap();
        assert_eq!(position.side, Side::Sell);
        assert_eq!(position.size, dec!(1.5));
    }

    #[tokio::test]
    async fn test_failure_injection_and_visibility_delay() {
        let exchange = SimulatedExchange::new();
        exchange.set_price("BTC", dec!(50000)).await;
        exchange.fail_next(Operation::Positions, 1).await;
        exchange.set_visibility_delay(2).await;

        assert!(exchange.get_positions().await.is_err());

        exchange.submit_market_order(&btc(), Side::Buy, dec!(0.01)).await.unwrap();
        assert!(exchange.get_positions().await.unwrap().is_empty());
        assert!(exchange.get_positions().await.unwrap().is_empty());
        assert_eq!(exchange.get_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_loss_requires_position() {
        let exchange = SimulatedExchange::new();
        let err = exchange.set_stop_loss(&btc(), dec!(48000)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::PositionNotFound(_)));
    }
}
