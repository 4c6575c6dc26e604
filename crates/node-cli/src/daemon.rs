//! 데몬 폴링 루프.

use node_execution::TradingNode;
use std::future::Future;
use std::time::Duration;

use crate::{new_correlation_id, PollStats};

/// `shutdown`이 완료될 때까지 `poll_every`마다 명령 피드를 폴링합니다.
///
/// 종료 future는 루프 전체에서 하나만 사용하므로 폴링 도중 완료되어도
/// 현재 폴링이 끝난 직후 루프를 빠져나옵니다.
pub async fn poll_until<F>(node: &TradingNode, poll_every: Duration, shutdown: F) -> PollStats
where
    F: Future<Output = ()>,
{
    let mut stats = PollStats::new();
    let mut interval = tokio::time::interval(poll_every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("종료 신호 수신, 데몬 종료 중...");
                break;
            }
            _ = interval.tick() => {
                match node.trigger_poll(&new_correlation_id()).await {
                    Ok(report) => stats.record(&report),
                    Err(e) => {
                        stats.record_error();
                        tracing::error!("명령 폴링 실패: {}", e);
                    }
                }
            }
        }
    }

    stats
}
