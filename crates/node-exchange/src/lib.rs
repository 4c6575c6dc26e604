//! 거래소 어댑터와 재시도 실행기.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - Exchange trait: 레버리지 거래소에 대한 통합 인터페이스
//! - Bybit 선물(linear) 커넥터 (REST v5)
//! - BingX 무기한 선물 커넥터
//! - 시뮬레이션 거래소 (테스트 및 드라이런용)
//! - 재시도 실행기: 지수 백오프 기반 비동기 재시도

pub mod connector;
pub mod error;
pub mod retry;
pub mod simulated;
pub mod traits;

pub use connector::{BingxClient, BingxConfig, BybitClient, BybitConfig};
pub use error::*;
pub use retry::{with_retry, RetryConfig, RetryStats};
pub use simulated::{ExchangeCall, Operation, SimulatedExchange};
pub use traits::*;
