//! 거래소 trait 정의.

use async_trait::async_trait;
use node_core::{Asset, ClosedPosition, Position, Side, WalletBalance};
use rust_decimal::Decimal;

use crate::ExchangeError;

/// 거래소 작업을 위한 Result 타입.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// 레버리지 거래소에 대한 통합 인터페이스.
///
/// 모든 금액과 수량은 `Decimal`입니다. 주문 제출 같은 변경 작업은 거래소에서
/// 멱등이 아니므로 재시도 여부는 호출자가 결정합니다.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// 거래소 이름 반환.
    fn name(&self) -> &str;

    // === 시장 데이터 ===

    /// 자산의 현재 마크 가격 조회.
    async fn get_price(&self, asset: &Asset) -> ExchangeResult<Decimal>;

    // === 계좌 ===

    /// 지갑 잔고 조회.
    async fn get_wallet_balance(&self) -> ExchangeResult<WalletBalance>;

    /// 오픈 포지션 전체 조회.
    async fn get_positions(&self) -> ExchangeResult<Vec<Position>>;

    /// 최근 종료된 포지션 조회.
    async fn get_positions_history(&self) -> ExchangeResult<Vec<ClosedPosition>> {
        Ok(vec![])
    }

    // === 주문 ===

    /// 자산의 레버리지 설정 (매수/매도 동일).
    async fn set_leverage(&self, asset: &Asset, leverage: Decimal) -> ExchangeResult<()>;

    /// 수량을 거래소의 수량 단위에 맞춰 내림합니다.
    async fn normalize_quantity(&self, asset: &Asset, quantity: Decimal) -> ExchangeResult<Decimal>;

    /// 시장가 주문 제출. 주문 ID를 반환합니다.
    async fn submit_market_order(
        &self,
        asset: &Asset,
        side: Side,
        quantity: Decimal,
    ) -> ExchangeResult<String>;

    /// 포지션의 손절 가격 설정.
    async fn set_stop_loss(&self, asset: &Asset, price: Decimal) -> ExchangeResult<()>;

    /// 포지션 청산. `quantity`가 `None`이면 전체 청산합니다.
    ///
    /// 포지션이 없으면 아무것도 하지 않습니다.
    async fn close_position(&self, asset: &Asset, quantity: Option<Decimal>) -> ExchangeResult<()>;

    /// 포지션 전체 청산.
    async fn close_whole_position(&self, asset: &Asset) -> ExchangeResult<()> {
        self.close_position(asset, None).await
    }
}

/// 수량을 단위의 배수로 내림합니다.
pub fn floor_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    ((quantity / step).floor() * step).normalize()
}
