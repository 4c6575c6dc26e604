//! # Node Core
//!
//! 원격 명령 기반 트레이딩 노드의 핵심 도메인 모델 및 공통 인프라를 제공합니다.
//!
//! 이 크레이트는 노드 전반에서 사용되는 기본 타입을 제공합니다:
//! - 명령(Command) 및 명령별 타입 지정 페이로드
//! - 포지션, 포지션 스냅샷, 지갑 잔고
//! - 에러 분류 (전송/거래소/비즈니스 규칙)
//! - 설정 관리
//! - 로깅 인프라 및 텔레메트리 인터페이스
//! - 머신 식별자

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod machine;
pub mod telemetry;

pub use config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
pub use machine::*;
pub use telemetry::*;
