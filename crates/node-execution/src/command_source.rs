//! 워터마크 기반 명령 소스.
//!
//! 워터마크는 노드 시작 시각으로 초기화되며 감소하지 않습니다.
//! 전진은 명령을 처리에 넘기는 쪽(디스패처)이 담당합니다.

use chrono::Utc;
use node_core::{Command, Telemetry};
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::coordinator::CommandFeed;
use crate::error::ExecutionResult;

/// 워터마크 이후의 명령을 가져오는 소스.
pub struct CommandSource {
    feed: Arc<dyn CommandFeed>,
    telemetry: Arc<dyn Telemetry>,
    watermark: AtomicI64,
}

impl CommandSource {
    /// 현재 시각을 워터마크로 사용하는 소스 생성.
    pub fn new(feed: Arc<dyn CommandFeed>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self::with_watermark(feed, telemetry, Utc::now().timestamp_millis())
    }

    pub fn with_watermark(feed: Arc<dyn CommandFeed>, telemetry: Arc<dyn Telemetry>, watermark: i64) -> Self {
        Self {
            feed,
            telemetry,
            watermark: AtomicI64::new(watermark),
        }
    }

    /// 현재 워터마크.
    pub fn watermark(&self) -> i64 {
        self.watermark.load(Ordering::SeqCst)
    }

    /// 워터마크를 `value`로 올립니다. 더 작은 값은 무시됩니다.
    pub fn advance_watermark(&self, value: i64) -> i64 {
        let previous = self.watermark.fetch_max(value, Ordering::SeqCst);
        previous.max(value)
    }

    /// 새 명령을 조회하여 `created_timestamp` 오름차순으로 반환합니다.
    ///
    /// 전송 실패는 그대로 호출자에게 전달되며 여기서 재시도하지 않습니다.
    pub async fn fetch_new_commands(&self, correlation_id: &str) -> ExecutionResult<Vec<Command>> {
        let watermark = self.watermark();
        let source = self.feed.source().to_string();
        self.telemetry.log_info(
            correlation_id,
            &format!("Fetching commands from {}", source),
            Some(&json!({ "watermark": watermark })),
        );

        let mut commands = self.feed.fetch_commands(watermark, correlation_id).await?;
        // 안정 정렬: 같은 시각이면 피드 순서 유지
        commands.sort_by_key(|c| c.created_timestamp);

        self.telemetry.log_info(
            correlation_id,
            &format!("Fetched {} commands from {}", commands.len(), source),
            Some(&json!(commands.iter().map(Command::to_json).collect::<Vec<_>>())),
        );
        Ok(commands)
    }
}
