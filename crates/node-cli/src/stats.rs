//! 폴링 통계 구조체.

use node_execution::DispatchReport;
use serde::Serialize;
use std::time::Duration;

/// 데몬 실행 동안의 폴링 통계
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStats {
    /// 폴링 시도 횟수
    pub polls: usize,
    /// 피드 조회 실패 횟수
    pub poll_errors: usize,
    /// 실행된 명령 수
    pub dispatched: usize,
    /// 실패한 명령 수
    pub failed: usize,
    /// 건너뛴 명령 수
    pub skipped: usize,
    /// 부모 대기로 보관된 명령 수
    pub held: usize,
    /// 보관 기간 초과로 버려진 명령 수
    pub evicted: usize,
    /// 실행 시간
    #[serde(skip)]
    pub elapsed: Duration,
}

impl PollStats {
    /// 새 통계 객체 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 폴링 한 번의 결과를 누적합니다.
    pub fn record(&mut self, report: &DispatchReport) {
        self.polls += 1;
        self.dispatched += report.dispatched.len();
        self.failed += report.failed.len();
        self.skipped += report.skipped.len();
        self.held += report.held.len();
        self.evicted += report.evicted.len();
    }

    /// 피드 조회 실패를 누적합니다.
    pub fn record_error(&mut self) {
        self.polls += 1;
        self.poll_errors += 1;
    }

    /// 명령 성공률 (%)
    pub fn success_rate(&self) -> f64 {
        let executed = self.dispatched.saturating_sub(self.skipped);
        if executed == 0 {
            0.0
        } else {
            (executed.saturating_sub(self.failed) as f64 / executed as f64) * 100.0
        }
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self, operation: &str) {
        tracing::info!(
            operation = operation,
            polls = self.polls,
            poll_errors = self.poll_errors,
            dispatched = self.dispatched,
            failed = self.failed,
            skipped = self.skipped,
            held = self.held,
            evicted = self.evicted,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "폴링 요약"
        );
    }
}
