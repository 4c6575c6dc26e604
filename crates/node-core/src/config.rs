//! 설정 관리.
//!
//! 노드 설정은 기본값, 선택적 TOML 파일, 환경 변수(`NODE__섹션__키`) 순서로
//! 덮어써지며 로드됩니다.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{NodeError, NodeResult};

/// 환경 변수 접두사.
pub const ENV_PREFIX: &str = "NODE";

/// 노드 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 노드 식별 설정
    pub node: NodeSettings,
    /// 코디네이터 연결 설정
    pub coordinator: CoordinatorConfig,
    /// 거래소 설정
    pub exchange: ExchangeSettings,
    /// 포지션 추적 설정
    pub tracker: TrackerConfig,
    /// 리스크 관리 설정
    pub risk: RiskConfig,
    /// 재시도 설정
    pub retry: RetrySettings,
    /// 명령 처리 설정
    pub commands: CommandConfig,
    /// 로깅 설정
    pub logging: LoggingConfig,
}

/// 노드 식별 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeSettings {
    /// 텔레메트리에 기록되는 애플리케이션 이름
    pub application_name: String,
    /// 코디네이터가 이 노드에 접근하는 공개 URL
    pub public_url: String,
    /// 등록 시 사용하는 별칭
    pub nickname: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            application_name: "customer-node".to_string(),
            public_url: String::new(),
            nickname: "NO NAME CUSTOMER".to_string(),
        }
    }
}

/// 코디네이터 연결 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// 코디네이터 기본 URL
    pub base_url: String,
    /// 명령 피드 경로 (뒤에 `/{watermark}`가 붙음)
    pub command_feed_path: String,
    /// 노드 등록 경로
    pub register_path: String,
    /// 구독할 코디네이터 ID 목록
    pub subscribed_to: Vec<String>,
    /// 요청 타임아웃 (초)
    pub request_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            command_feed_path: "/investing/customer-commands".to_string(),
            register_path: "/customers/register".to_string(),
            subscribed_to: Vec::new(),
            request_timeout_secs: 30,
        }
    }
}

/// 거래소 설정.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// 사용할 거래소 ("simulated", "bybit", "bingx")
    pub venue: String,
    /// API 키
    pub api_key: String,
    /// API 시크릿
    pub api_secret: String,
    /// 테스트넷 사용 여부
    pub testnet: bool,
    /// 요청 타임아웃 (초)
    pub timeout_secs: u64,
    /// 수신 윈도우 (밀리초)
    pub recv_window: u64,
    /// 정산 코인
    pub settle_coin: String,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            venue: "simulated".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            testnet: false,
            timeout_secs: 30,
            recv_window: 5000,
            settle_coin: "USDT".to_string(),
        }
    }
}

impl std::fmt::Debug for ExchangeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeSettings")
            .field("venue", &self.venue)
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"[MASKED]")
            .field("testnet", &self.testnet)
            .field("timeout_secs", &self.timeout_secs)
            .field("recv_window", &self.recv_window)
            .field("settle_coin", &self.settle_coin)
            .finish()
    }
}

fn mask(value: &str) -> String {
    if value.len() <= 8 {
        "[MASKED]".to_string()
    } else {
        format!("{}...{}", &value[..4], &value[value.len() - 4..])
    }
}

/// 포지션 추적 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// 폴링 간격 (밀리초)
    pub interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { interval_ms: 3000 }
    }
}

/// 리스크 관리 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RiskConfig {
    /// 소프트 손절 유지 시간 (밀리초)
    pub dwell_window_ms: u64,
    /// 기본 손절 비율 (%)
    pub default_stop_loss_pct: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            dwell_window_ms: 300_000,
            default_stop_loss_pct: Decimal::new(4, 0),
        }
    }
}

/// 재시도 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// 첫 대기 시간 (밀리초)
    pub initial_interval_ms: u64,
    /// 대기 시간 배수
    pub multiplier: f64,
    /// 최대 재시도 횟수
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: 3000,
            multiplier: 1.5,
            max_retries: 3,
        }
    }
}

/// 명령 처리 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandConfig {
    /// 부모 완료를 기다리는 명령의 보존 시간 (초)
    pub held_ttl_secs: u64,
    /// 기억할 완료 명령 ID 수
    pub completed_memory: usize,
    /// 데몬 모드 폴링 주기 (초)
    pub poll_interval_secs: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            held_ttl_secs: 600,
            completed_memory: 1024,
            poll_interval_secs: 5,
        }
    }
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl NodeConfig {
    /// `.env`, 선택적 파일, 환경 변수에서 설정을 로드합니다.
    pub fn load(path: Option<&Path>) -> NodeResult<Self> {
        // .env 파일이 없으면 무시
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .set_default("node.application_name", "customer-node")?
            .set_default("node.nickname", "NO NAME CUSTOMER")?
            .set_default("exchange.venue", "simulated")?
            .set_default("exchange.settle_coin", "USDT")?
            .set_default("tracker.interval_ms", 3000)?
            .set_default("risk.dwell_window_ms", 300_000)?
            .set_default("retry.initial_interval_ms", 3000)?
            .set_default("retry.multiplier", 1.5)?
            .set_default("retry.max_retries", 3)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?;

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("coordinator.subscribed_to")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// 설정값의 유효성을 검사합니다.
    pub fn validate(&self) -> NodeResult<()> {
        if self.tracker.interval_ms == 0 {
            return Err(NodeError::Config("tracker.interval_ms must be positive".into()));
        }
        if self.risk.dwell_window_ms == 0 {
            return Err(NodeError::Config("risk.dwell_window_ms must be positive".into()));
        }
        if self.risk.default_stop_loss_pct <= Decimal::ZERO
            || self.risk.default_stop_loss_pct >= Decimal::ONE_HUNDRED
        {
            return Err(NodeError::Config(
                "risk.default_stop_loss_pct must be within (0, 100)".into(),
            ));
        }
        if self.retry.initial_interval_ms == 0 {
            return Err(NodeError::Config("retry.initial_interval_ms must be positive".into()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(NodeError::Config("retry.multiplier must be >= 1".into()));
        }
        if self.commands.held_ttl_secs == 0 || self.commands.poll_interval_secs == 0 {
            return Err(NodeError::Config(
                "commands.held_ttl_secs and commands.poll_interval_secs must be positive".into(),
            ));
        }

        match self.exchange.venue.as_str() {
            "simulated" => {}
            venue @ ("bybit" | "bingx") => {
                if self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty() {
                    return Err(NodeError::Config(format!(
                        "{} venue requires exchange.api_key and exchange.api_secret",
                        venue
                    )));
                }
            }
            other => {
                return Err(NodeError::Config(format!("Unknown exchange venue: {}", other)));
            }
        }

        Ok(())
    }
}
