//! 명령 수집, 디스패치, 포지션 추적.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - 코디네이터 HTTP 클라이언트 (명령 피드, 노드 등록)
//! - 워터마크 기반 명령 소스
//! - 부모/자식 대기 처리를 포함한 순차 명령 디스패처
//! - 주기적 포지션 추적기
//! - 위 구성 요소를 묶는 `TradingNode`

pub mod command_source;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod node;
pub mod position_tracker;

pub use command_source::CommandSource;
pub use coordinator::{CommandFeed, CoordinatorClient, Registration, COMMON_ID_HEADER, MACHINE_ID_HEADER};
pub use dispatcher::{CommandDispatcher, DispatchReport, DispatcherSettings};
pub use error::{ExecutionError, ExecutionResult};
pub use node::{create_exchange, NodeTasks, TradingNode, TradingNodeBuilder};
pub use position_tracker::PositionTracker;
