//! Remote-commanded trading node CLI.

use anyhow::Context;
use clap::{Parser, Subcommand};
use node_cli::{new_correlation_id, poll_until, PollStats};
use node_core::{init_logging, Asset, LogConfig, NodeConfig};
use node_execution::TradingNode;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "trading-node")]
#[command(about = "Remote-commanded trading execution node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 설정 파일 경로 (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// 로그 레벨 (설정 파일의 logging.level 대신 사용)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// 데몬 모드: 포지션 추적, 손절 감시, 주기적 명령 폴링
    Run,

    /// 명령 피드를 한 번 폴링하여 처리
    Poll,

    /// 코디네이터에 노드 등록
    Register,

    /// 로컬 머신 식별자 출력
    MachineId,

    /// 자산의 현재 가격 조회
    Price {
        /// 자산 코드 (예: BTC)
        asset: String,
    },

    /// 지갑 잔고 조회
    Wallet,

    /// 오픈 포지션 조회
    Positions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = NodeConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;

    // 로깅 초기화
    let mut log_config = LogConfig::from_settings(&config.logging);
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    init_logging(log_config).map_err(|e| anyhow::anyhow!("로깅 초기화 실패: {}", e))?;

    let node = TradingNode::builder(config).build()?;
    tracing::debug!(machine_id = node.machine_id(), venue = node.exchange().name(), "노드 준비 완료");

    match cli.command {
        Commands::Run => run_daemon(&node).await?,
        Commands::Poll => {
            let mut stats = PollStats::new();
            let started = Instant::now();
            let report = node.trigger_poll(&new_correlation_id()).await?;
            stats.record(&report);
            // 보호 손절 작업이 끝날 때까지 프로세스를 유지
            node.drain().await;
            stats.elapsed = started.elapsed();
            stats.log_summary("단일 폴링");
        }
        Commands::Register => {
            node.register(&new_correlation_id()).await?;
            println!("registered as {}", node.machine_id());
        }
        Commands::MachineId => println!("{}", node.machine_id()),
        Commands::Price { asset } => {
            let asset = Asset::new(asset);
            let price = node.price(&asset).await?;
            println!("{} {}", asset, price);
        }
        Commands::Wallet => {
            let total = node.wallet_total().await?;
            let available = node.wallet_available().await?;
            println!(
                "{}",
                serde_json::json!({ "totalAmount": total, "availableAmount": available })
            );
        }
        Commands::Positions => {
            let positions = node.refresh_positions().await;
            println!("{}", serde_json::to_string_pretty(&positions)?);
        }
    }

    Ok(())
}

async fn run_daemon(node: &TradingNode) -> anyhow::Result<()> {
    let poll_every = Duration::from_secs(node.config().commands.poll_interval_secs);
    tracing::info!(
        machine_id = node.machine_id(),
        poll_interval_secs = poll_every.as_secs(),
        "=== 데몬 모드 시작 ==="
    );

    let shutdown = CancellationToken::new();
    let tasks = node.start(shutdown.clone());

    // 등록 실패는 데몬을 멈추지 않음
    if let Err(e) = node.register(&new_correlation_id()).await {
        tracing::error!("노드 등록 실패: {}", e);
    }

    let started = Instant::now();
    let mut stats = poll_until(node, poll_every, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("종료 신호 대기 실패: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    shutdown.cancel();
    tasks.join().await;
    // 진행 중인 보호 손절은 끝까지 실행
    node.drain().await;

    stats.elapsed = started.elapsed();
    stats.log_summary("데몬");
    tracing::info!("트레이딩 노드 종료");
    Ok(())
}
