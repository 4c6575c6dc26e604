//! 손절 감시자.
//!
//! 포지션 추적기의 스냅샷마다 자산별 상태를 갱신하고 청산을 실행합니다.
//!
//! ```text
//! CLEAR ──(돌파)──▶ BREACHED ──(유지 시간 초과)──▶ CLOSED (레코드 제거)
//!   ▲                  │
//!   └────(회복)────────┘
//! ```
//!
//! 레지스트리 잠금은 평가 중에만 잡고, 거래소 호출 동안에는 놓습니다.

use chrono::Utc;
use futures::future::join_all;
use node_core::{Asset, PositionSnapshot, Telemetry};
use node_exchange::Exchange;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{ActiveStopLoss, BreachState, PnlStopLoss};

const CORRELATION_ID: &str = "stop-loss-supervisor";

/// 청산 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 소프트 손절 유지 시간 초과
    SoftStop,
    /// PnL 임계값 하회
    PnlStop,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::SoftStop => write!(f, "soft stop loss"),
            CloseReason::PnlStop => write!(f, "pnl stop loss"),
        }
    }
}

/// 스냅샷 처리 결과.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SupervisorReport {
    /// 청산에 성공한 자산
    pub closed: Vec<(Asset, CloseReason)>,
    /// 청산에 실패한 자산과 에러 메시지
    pub failed: Vec<(Asset, CloseReason, String)>,
    /// 포지션이 없어 정리된 자산
    pub pruned: Vec<Asset>,
}

#[derive(Debug, Default)]
struct Registry {
    active: HashMap<Asset, ActiveStopLoss>,
    pnl: HashMap<Asset, PnlStopLoss>,
    /// 청산 진행 중인 자산
    in_flight: HashSet<Asset>,
}

/// 자산별 소프트/PnL 손절 감시자.
pub struct StopLossSupervisor {
    exchange: Arc<dyn Exchange>,
    telemetry: Arc<dyn Telemetry>,
    dwell_window_ms: i64,
    registry: Mutex<Registry>,
}

impl StopLossSupervisor {
    pub fn new(exchange: Arc<dyn Exchange>, telemetry: Arc<dyn Telemetry>, dwell_window_ms: u64) -> Self {
        Self {
            exchange,
            telemetry,
            dwell_window_ms: i64::try_from(dwell_window_ms).unwrap_or(i64::MAX),
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // 레지스트리는 잠금 중 패닉하지 않으므로 poison 상태도 그대로 사용
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 자산의 소프트 손절을 등록하거나 교체합니다. 돌파 시각은 초기화됩니다.
    pub fn set_soft_stop_loss(&self, asset: Asset, threshold_price: Decimal) {
        info!(%asset, %threshold_price, "Soft stop loss registered");
        self.registry()
            .active
            .insert(asset.clone(), ActiveStopLoss::new(asset, threshold_price));
    }

    /// 자산의 PnL 손절을 등록하거나 교체합니다. `None`은 검사를 끕니다.
    pub fn set_pnl_stop_loss(&self, asset: Asset, threshold: Option<Decimal>) {
        info!(%asset, ?threshold, "PnL stop loss registered");
        self.registry()
            .pnl
            .insert(asset.clone(), PnlStopLoss { asset, threshold });
    }

    pub fn active_stop_loss(&self, asset: &Asset) -> Option<ActiveStopLoss> {
        self.registry().active.get(asset).cloned()
    }

    pub fn pnl_stop_loss(&self, asset: &Asset) -> Option<PnlStopLoss> {
        self.registry().pnl.get(asset).cloned()
    }

    /// 스냅샷으로 상태를 갱신하고 청산할 자산을 결정합니다.
    ///
    /// 결정된 자산은 진행 중으로 표시됩니다.
    fn evaluate(&self, snapshot: &PositionSnapshot, now_ms: i64) -> (Vec<(Asset, CloseReason)>, Vec<Asset>) {
        let mut registry = self.registry();
        let Registry {
            active,
            pnl,
            in_flight,
        } = &mut *registry;

        let open: HashSet<&Asset> = snapshot
            .positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| &p.asset)
            .collect();

        let mut pruned: Vec<Asset> = active
            .keys()
            .chain(pnl.keys())
            .filter(|asset| !open.contains(asset))
            .cloned()
            .collect();
        pruned.sort();
        pruned.dedup();
        for asset in &pruned {
            active.remove(asset);
            pnl.remove(asset);
        }

        let mut decisions = Vec::new();
        for position in snapshot.positions.iter().filter(|p| p.is_open()) {
            let asset = &position.asset;
            if in_flight.contains(asset) {
                debug!(%asset, "Close in flight, skipping");
                continue;
            }

            let soft_expired = match active.get_mut(asset) {
                Some(stop) => {
                    let state = stop.observe(position, now_ms, self.dwell_window_ms);
                    if state == BreachState::Breached && stop.breach_timestamp == now_ms {
                        debug!(%asset, price = %position.price, threshold = %stop.threshold_price, "Soft stop breached");
                    }
                    state == BreachState::Expired
                }
                None => false,
            };

            let pnl_triggered = pnl
                .get(asset)
                .map(|stop| stop.is_triggered_by(position))
                .unwrap_or(false);

            let reason = if pnl_triggered {
                Some(CloseReason::PnlStop)
            } else if soft_expired {
                Some(CloseReason::SoftStop)
            } else {
                None
            };

            if let Some(reason) = reason {
                in_flight.insert(asset.clone());
                decisions.push((asset.clone(), reason));
            }
        }

        (decisions, pruned)
    }

    /// 포지션 스냅샷 하나를 처리합니다.
    ///
    /// 조회 실패 스냅샷도 빈 포지션 목록으로 취급하므로 모든 레코드가 정리됩니다.
    pub async fn on_snapshot(&self, snapshot: &PositionSnapshot, now_ms: i64) -> SupervisorReport {
        if !snapshot.ok {
            warn!("Position snapshot failed, treating as no open positions");
        }

        let (decisions, pruned) = self.evaluate(snapshot, now_ms);
        if !pruned.is_empty() {
            debug!(?pruned, "Pruned stop losses without open positions");
        }

        let mut report = SupervisorReport {
            pruned,
            ..Default::default()
        };

        if decisions.is_empty() {
            return report;
        }

        for (asset, reason) in &decisions {
            self.telemetry.log_warn(
                CORRELATION_ID,
                &format!("Closing {} position: {} triggered", asset, reason),
                snapshot
                    .find(asset)
                    .map(|p| json!({"price": p.price, "pnl": p.pnl, "side": p.side}))
                    .as_ref(),
            );
        }

        let closes = decisions.iter().map(|(asset, _)| self.exchange.close_whole_position(asset));
        let results = join_all(closes).await;

        let mut registry = self.registry();
        for ((asset, reason), result) in decisions.into_iter().zip(results) {
            registry.in_flight.remove(&asset);
            match result {
                Ok(()) => {
                    match reason {
                        CloseReason::SoftStop => {
                            registry.active.remove(&asset);
                        }
                        CloseReason::PnlStop => {
                            registry.pnl.remove(&asset);
                        }
                    }
                    self.telemetry.log_info(
                        CORRELATION_ID,
                        &format!("Position {} closed by {}", asset, reason),
                        None,
                    );
                    report.closed.push((asset, reason));
                }
                Err(e) => {
                    warn!(%asset, %reason, error = %e, "Stop loss close failed");
                    self.telemetry.log_error(
                        CORRELATION_ID,
                        &format!("Closing {} by {} failed", asset, reason),
                        Some(&json!({"error": e.to_string()})),
                    );
                    report.failed.push((asset, reason, e.to_string()));
                }
            }
        }

        report
    }

    /// 스냅샷 채널을 구독하며 종료 신호까지 감시합니다.
    pub async fn run(self: Arc<Self>, mut snapshots: watch::Receiver<PositionSnapshot>, shutdown: CancellationToken) {
        info!(dwell_window_ms = self.dwell_window_ms, "Stop-loss supervisor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stop-loss supervisor stopping");
                    break;
                }
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        warn!("Position snapshot channel closed");
                        break;
                    }
                    let snapshot = snapshots.borrow_and_update().clone();
                    self.on_snapshot(&snapshot, Utc::now().timestamp_millis()).await;
                }
            }
        }
    }
}
