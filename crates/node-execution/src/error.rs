//! 실행 계층 에러 타입.

use node_core::NodeError;
use node_exchange::ExchangeError;
use thiserror::Error;

/// 명령 수집/처리 에러.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// 코디네이터 요청 실패 (네트워크/타임아웃)
    #[error("Failed to fetch commands: {0}")]
    FeedTransport(String),

    /// 코디네이터가 실패 상태 코드를 반환
    #[error("Coordinator returned {status}: {message}")]
    FeedStatus { status: u16, message: String },

    /// 응답 본문을 해석할 수 없음
    #[error("Failed to decode coordinator response: {0}")]
    Decode(String),

    /// 거래소 에러
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// 주문 수량을 계산할 수 없음
    #[error("Invalid order: {0}")]
    InvalidOrder(String),
}

/// 실행 작업을 위한 Result 타입.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

impl From<reqwest::Error> for ExecutionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExecutionError::Decode(err.to_string())
        } else {
            ExecutionError::FeedTransport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(err: serde_json::Error) -> Self {
        ExecutionError::Decode(err.to_string())
    }
}

impl From<ExecutionError> for NodeError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::FeedTransport(msg) => NodeError::Transport(msg),
            // 코디네이터의 비즈니스 메시지는 원문 그대로 분류
            ExecutionError::FeedStatus { message, .. } => NodeError::classify(message),
            ExecutionError::Decode(msg) => NodeError::Decode(msg),
            ExecutionError::Exchange(e) => e.into(),
            ExecutionError::InvalidOrder(msg) => NodeError::Internal(msg),
        }
    }
}
