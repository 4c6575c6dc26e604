//! 포지션 리스크 감시.
//!
//! 이 crate는 다음 기능을 제공합니다:
//! - 소프트 손절: 임계 가격 돌파가 유지 시간 이상 지속될 때 청산
//! - PnL 손절: 미실현 손익이 임계값 아래로 내려가면 즉시 청산
//! - 오픈 포지션이 사라진 자산의 감시 상태 정리
//!
//! # 예제
//!
//! ```rust,ignore
//! use node_risk::StopLossSupervisor;
//!
//! let supervisor = Arc::new(StopLossSupervisor::new(exchange, telemetry, 300_000));
//! supervisor.set_soft_stop_loss(Asset::new("BTC"), dec!(40000));
//! tokio::spawn(supervisor.clone().run(tracker.subscribe(), shutdown.clone()));
//! ```

pub mod registry;
pub mod supervisor;

pub use registry::{ActiveStopLoss, BreachState, PnlStopLoss};
pub use supervisor::{CloseReason, StopLossSupervisor, SupervisorReport};
