//! 재시도 실행기.
//!
//! 결과적 일관성을 갖는 거래소 상태(예: 주문 직후의 포지션 조회)를 기다릴 때 사용합니다.
//! 매 시도 전에 대기하며, 대기 시간은 시도마다 `multiplier`배로 늘어납니다.
//!
//! ```text
//! initial=3000, multiplier=1.5, max_retries=3
//! wait 3000 → attempt 1 → wait 4500 → attempt 2 → wait 6750 → attempt 3 → wait 10125 → attempt 4
//! ```
//!
//! 모든 대기는 `tokio::time::sleep`으로 이루어지므로 호출자의 다른 작업을 막지 않습니다.

use chrono::{DateTime, Utc};
use node_core::RetrySettings;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 재시도 설정.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// 첫 시도 전 대기 시간
    pub initial_interval: Duration,
    /// 대기 시간 배수
    pub multiplier: f64,
    /// 첫 실패 이후 허용되는 재시도 횟수
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(3000),
            multiplier: 1.5,
            max_retries: 3,
        }
    }
}

impl RetryConfig {
    pub fn new(initial_interval: Duration, multiplier: f64, max_retries: u32) -> Self {
        Self {
            initial_interval,
            multiplier,
            max_retries,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_interval_ms),
            settings.multiplier,
            settings.max_retries,
        )
    }

    /// 시도별 대기 시간 목록 (밀리초).
    pub fn schedule_ms(&self) -> Vec<u64> {
        let mut delays = Vec::with_capacity(self.max_retries as usize + 1);
        let mut current = self.initial_interval.as_millis() as f64;
        for _ in 0..=self.max_retries {
            delays.push(current.round() as u64);
            current *= self.multiplier;
        }
        delays
    }
}

/// 재시도 실행 통계.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStats {
    /// 작업 호출 횟수
    pub attempts: u32,
    /// 실패 횟수
    pub failures: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub succeeded: bool,
    pub last_error: Option<String>,
    /// 각 시도 전에 대기한 시간 (밀리초)
    pub delays_ms: Vec<u64>,
}

impl RetryStats {
    fn start() -> Self {
        Self {
            attempts: 0,
            failures: 0,
            start_time: Utc::now(),
            end_time: None,
            succeeded: false,
            last_error: None,
            delays_ms: Vec::new(),
        }
    }

    fn finish(&mut self, succeeded: bool) {
        self.succeeded = succeeded;
        self.end_time = Some(Utc::now());
    }

    /// 총 소요 시간 (밀리초).
    pub fn elapsed_ms(&self) -> i64 {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
            .unwrap_or(0)
    }
}

/// 작업을 지수 백오프로 재시도합니다.
///
/// 시도 횟수가 `max_retries`를 넘으면 마지막 에러를 반환합니다.
/// 결과와 함께 실행 통계를 돌려줍니다.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, mut task: F) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut stats = RetryStats::start();
    let mut interval_ms = config.initial_interval.as_millis() as f64;

    loop {
        let delay = interval_ms.round() as u64;
        stats.delays_ms.push(delay);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        stats.attempts += 1;
        match task().await {
            Ok(value) => {
                stats.finish(true);
                debug!(attempts = stats.attempts, "Retry task succeeded");
                return (Ok(value), stats);
            }
            Err(e) => {
                stats.failures += 1;
                stats.last_error = Some(e.to_string());

                if stats.attempts > config.max_retries {
                    stats.finish(false);
                    warn!(
                        attempts = stats.attempts,
                        error = %e,
                        "Retry budget exhausted"
                    );
                    return (Err(e), stats);
                }

                debug!(
                    attempt = stats.attempts,
                    max_retries = config.max_retries,
                    error = %e,
                    "Retry task failed, rescheduling"
                );
                interval_ms *= config.multiplier;
            }
        }
    }
}
