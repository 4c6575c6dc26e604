//! 트레이딩 노드의 에러 타입.
//!
//! 경계 계층(HTTP 컨트롤러 등)이 상태 코드로 매핑할 수 있도록
//! 에러를 전송/거래소/비즈니스 규칙/디코딩/설정/내부 에러로 분류합니다.

use thiserror::Error;

/// 코디네이터가 정의한 비즈니스 규칙 에러.
///
/// 메시지 문자열이 그대로 전달되므로 원문 메시지로 식별합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusinessError {
    /// 요청 빈도 제한 (12시간에 한 번)
    TooManyRequests,
    /// 지갑 잔고 부족
    InsufficientFunds,
    /// 대기 중인 지연 충전 존재
    PendingDeferredRefill,
    /// 충전 금액 과다
    TooBigRefill,
    /// 허용 예치금 초과 포지션
    DepoExceeded,
}

impl BusinessError {
    /// 모든 비즈니스 에러 반환.
    pub fn all() -> [BusinessError; 5] {
        [
            BusinessError::TooManyRequests,
            BusinessError::InsufficientFunds,
            BusinessError::PendingDeferredRefill,
            BusinessError::TooBigRefill,
            BusinessError::DepoExceeded,
        ]
    }

    /// 에러 코드 문자열.
    pub fn code(&self) -> &'static str {
        match self {
            BusinessError::TooManyRequests => "TOO_MANY_REQUESTS",
            BusinessError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            BusinessError::PendingDeferredRefill => "PENDING_DEFERRED_REFILL",
            BusinessError::TooBigRefill => "TOO_BIG_REFILL",
            BusinessError::DepoExceeded => "DEPO_EXCEEDED",
        }
    }

    /// 코디네이터가 사용하는 원문 메시지.
    pub fn message(&self) -> &'static str {
        match self {
            BusinessError::TooManyRequests => "Send money operation is allowed once a 12h only",
            BusinessError::InsufficientFunds => "Not enough money on wallet",
            BusinessError::PendingDeferredRefill => "There is pending refill",
            BusinessError::TooBigRefill => {
                "Trying to refill amount that will not left then enough money to next Frugal refill"
            }
            BusinessError::DepoExceeded => "You try to open too big position",
        }
    }

    /// 원문 메시지로부터 비즈니스 에러를 식별합니다.
    pub fn from_message(message: &str) -> Option<Self> {
        let message = message.trim();
        Self::all().into_iter().find(|e| e.message() == message)
    }

    /// 경계 계층이 사용할 HTTP 상태 코드.
    pub fn http_status(&self) -> u16 {
        match self {
            BusinessError::TooManyRequests => 429,
            BusinessError::InsufficientFunds => 402,
            BusinessError::PendingDeferredRefill
            | BusinessError::TooBigRefill
            | BusinessError::DepoExceeded => 409,
        }
    }
}

impl std::fmt::Display for BusinessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for BusinessError {}

/// 노드 최상위 에러.
#[derive(Debug, Error)]
pub enum NodeError {
    /// 네트워크/타임아웃 등 전송 에러
    #[error("전송 에러: {0}")]
    Transport(String),

    /// 거래소 도메인 에러
    #[error("거래소 에러: {0}")]
    Exchange(String),

    /// 비즈니스 규칙 에러 (원문 메시지 그대로 전달)
    #[error("{0}")]
    Business(BusinessError),

    /// 명령 디코딩 에러
    #[error("디코딩 에러: {0}")]
    Decode(String),

    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    /// 내부 에러
    #[error("내부 에러: {0}")]
    Internal(String),
}

/// 노드 작업을 위한 Result 타입.
pub type NodeResult<T> = Result<T, NodeError>;

impl NodeError {
    /// 메시지를 분류합니다. 비즈니스 메시지는 `Business`로, 나머지는 `Internal`로.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        match BusinessError::from_message(&message) {
            Some(business) => NodeError::Business(business),
            None => NodeError::Internal(message),
        }
    }

    /// 비즈니스 에러를 반환합니다.
    pub fn business(&self) -> Option<BusinessError> {
        match self {
            NodeError::Business(b) => Some(*b),
            _ => None,
        }
    }

    /// 경계 계층이 사용할 HTTP 상태 코드.
    pub fn http_status(&self) -> u16 {
        match self {
            NodeError::Business(b) => b.http_status(),
            _ => 500,
        }
    }

    /// 재시도 가능한 에러인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Transport(_))
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Decode(err.to_string())
    }
}

impl From<config::ConfigError> for NodeError {
    fn from(err: config::ConfigError) -> Self {
        NodeError::Config(err.to_string())
    }
}
