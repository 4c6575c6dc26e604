//! 자산별 손절 감시 레코드.

use node_core::{Asset, Position, Side};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 소프트 손절 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachState {
    /// 돌파가 관측되지 않음
    Clear,
    /// 돌파가 지속 중이지만 유지 시간이 지나지 않음
    Breached,
    /// 유지 시간을 넘겨 청산 대상
    Expired,
}

/// 자산의 소프트 손절 (자산당 하나).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStopLoss {
    pub asset: Asset,
    pub threshold_price: Decimal,
    /// 지속 돌파가 시작된 시각 (ms). 0이면 돌파 없음.
    ///
    /// 0이 예약값이므로 `now_ms == 0`에 시작된 돌파는 1로 기록됩니다.
    pub breach_timestamp: i64,
}

impl ActiveStopLoss {
    pub fn new(asset: Asset, threshold_price: Decimal) -> Self {
        Self {
            asset,
            threshold_price,
            breach_timestamp: 0,
        }
    }

    /// 포지션 방향 기준으로 가격이 임계값을 넘었는지 확인합니다.
    ///
    /// 롱은 가격이 임계값 이하, 숏은 이상일 때 돌파입니다.
    pub fn is_breached_by(&self, side: Side, price: Decimal) -> bool {
        match side {
            Side::Buy => price <= self.threshold_price,
            Side::Sell => price >= self.threshold_price,
        }
    }

    /// 새 포지션 관측으로 상태를 진행시킵니다.
    pub fn observe(&mut self, position: &Position, now_ms: i64, dwell_window_ms: i64) -> BreachState {
        if !self.is_breached_by(position.side, position.price) {
            self.breach_timestamp = 0;
            return BreachState::Clear;
        }

        if self.breach_timestamp == 0 {
            self.breach_timestamp = now_ms.max(1);
            return BreachState::Breached;
        }

        if now_ms - self.breach_timestamp > dwell_window_ms {
            BreachState::Expired
        } else {
            BreachState::Breached
        }
    }
}

/// 자산의 PnL 손절 (자산당 하나). 임계값이 `None`이면 검사하지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlStopLoss {
    pub asset: Asset,
    pub threshold: Option<Decimal>,
}

impl PnlStopLoss {
    pub fn is_triggered_by(&self, position: &Position) -> bool {
        matches!(self.threshold, Some(threshold) if position.pnl < threshold)
    }
}
