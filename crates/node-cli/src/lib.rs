//! `trading-node` 바이너리 지원 모듈.

pub mod daemon;
pub mod stats;

pub use daemon::poll_until;
pub use stats::PollStats;

/// 새 상관 ID.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
