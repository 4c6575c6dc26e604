//! 거래소 에러 타입.

use node_core::{BusinessError, NodeError};
use thiserror::Error;

/// 거래소 관련 에러.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    NetworkError(String),

    /// 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 요청 한도 초과
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// 인증/권한 에러
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// API 에러 코드
    #[error("API error {code}: {message}")]
    ApiError { code: i64, message: String },

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    ParseError(String),

    /// 유효하지 않은 수량
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// 포지션이 존재하지 않음
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    /// 코디네이터 비즈니스 규칙 위반
    #[error("{0}")]
    Business(BusinessError),

    /// 알 수 없는 에러
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ExchangeError {
    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_)
                | ExchangeError::Timeout(_)
                | ExchangeError::RateLimited(_)
        )
    }

    /// 거래소 응답 메시지를 분류합니다.
    ///
    /// 비즈니스 규칙 메시지는 `Business`로, 나머지는 `ApiError`로 유지합니다.
    pub fn from_venue(code: i64, message: &str) -> Self {
        match BusinessError::from_message(message) {
            Some(business) => ExchangeError::Business(business),
            None => ExchangeError::ApiError {
                code,
                message: message.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ExchangeError::NetworkError(err.to_string())
        } else if err.is_decode() {
            ExchangeError::ParseError(err.to_string())
        } else {
            ExchangeError::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}

impl From<ExchangeError> for NodeError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Business(business) => NodeError::Business(business),
            ExchangeError::NetworkError(msg) | ExchangeError::Timeout(msg) => {
                NodeError::Transport(msg)
            }
            ExchangeError::ParseError(msg) => NodeError::Decode(msg),
            other => NodeError::Exchange(other.to_string()),
        }
    }
}
