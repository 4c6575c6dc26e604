//! 거래소에서 읽어온 포지션과 지갑 상태.
//!
//! 포지션은 매 폴링마다 거래소로부터 다시 만들어지며 로컬에서 수정되지 않습니다.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Asset, Side};

/// 거래소의 오픈 포지션.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// 자산
    pub asset: Asset,
    /// 거래소 심볼 (포지션의 유일한 식별자)
    pub symbol: String,
    /// 방향
    pub side: Side,
    /// 현재 마크 가격
    pub price: Decimal,
    /// 평균 진입 가격
    pub avg_price: Decimal,
    /// 보유 수량
    pub size: Decimal,
    /// 미실현 손익
    pub pnl: Decimal,
    /// 레버리지
    pub leverage: Decimal,
    /// 설정된 손절 가격
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// 설정된 익절 가격
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    /// 레버리지를 반영한 진입가 대비 변화율 (%)
    pub profit_percent: Decimal,
    /// 거래소 기준 마지막 갱신 시각 (ms)
    pub updated: i64,
    /// 거래소 원본 응답
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl Position {
    /// 수량이 있는 포지션인지 확인합니다.
    pub fn is_open(&self) -> bool {
        !self.size.is_zero()
    }

    /// 레버리지가 반영된 수익률(%)을 계산합니다.
    ///
    /// 진입가가 0이면 `None`을 반환합니다.
    pub fn leveraged_percent_change(
        avg_price: Decimal,
        price: Decimal,
        side: Side,
        leverage: Decimal,
    ) -> Option<Decimal> {
        if avg_price.is_zero() {
            return None;
        }
        let change = (price - avg_price) / avg_price * Decimal::ONE_HUNDRED;
        let signed = match side {
            Side::Buy => change,
            Side::Sell => -change,
        };
        Some(signed * leverage)
    }
}

/// 포지션 추적기가 발행하는 전체 교체 스냅샷.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    /// 오픈 포지션 목록
    pub positions: Vec<Position>,
    /// 스냅샷 생성 시각 (ms)
    pub taken_at: i64,
    /// 조회 성공 여부 (실패 시 빈 목록)
    pub ok: bool,
}

impl PositionSnapshot {
    pub fn new(positions: Vec<Position>, taken_at: i64) -> Self {
        Self {
            positions,
            taken_at,
            ok: true,
        }
    }

    /// 조회 실패를 나타내는 빈 스냅샷.
    pub fn failed(taken_at: i64) -> Self {
        Self {
            positions: Vec::new(),
            taken_at,
            ok: false,
        }
    }

    pub fn find(&self, asset: &Asset) -> Option<&Position> {
        self.positions.iter().find(|p| &p.asset == asset)
    }
}

impl Default for PositionSnapshot {
    fn default() -> Self {
        Self::new(Vec::new(), Utc::now().timestamp_millis())
    }
}

/// 지갑 잔고 (한 작업 동안만 유효).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    /// 주문에 사용 가능한 금액
    pub available_amount: Decimal,
    /// 총 자산
    pub total_amount: Decimal,
}

/// 종료된 포지션 기록.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPosition {
    pub asset: Asset,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub avg_exit_price: Decimal,
    pub closed_pnl: Decimal,
    pub leverage: Decimal,
    /// 종료 시각 (ms)
    pub closed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_leveraged_percent_change() {
        let buy = Position::leveraged_percent_change(dec!(100), dec!(110), Side::Buy, dec!(5));
        assert_eq!(buy, Some(dec!(50)));

        let sell = Position::leveraged_percent_change(dec!(100), dec!(110), Side::Sell, dec!(2));
        assert_eq!(sell, Some(dec!(-20)));

        assert_eq!(
            Position::leveraged_percent_change(Decimal::ZERO, dec!(1), Side::Buy, dec!(1)),
            None
        );
    }

    #[test]
    fn test_snapshot_find() {
        let snapshot = PositionSnapshot::failed(10);
        assert!(!snapshot.ok);
        assert!(snapshot.find(&Asset::new("BTC")).is_none());
    }
}
