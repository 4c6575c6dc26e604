//! 코디네이터 HTTP 클라이언트.
//!
//! - `GET {base}{feed_path}/{watermark}`: 워터마크 이후의 명령 조회
//! - `POST {base}{register_path}`: 노드 등록

use async_trait::async_trait;
use chrono::Utc;
use node_core::{Command, CoordinatorConfig, NodeSettings};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ExecutionError, ExecutionResult};

/// 상관 ID 헤더.
pub const COMMON_ID_HEADER: &str = "x-common-id";
/// 머신 ID 헤더.
pub const MACHINE_ID_HEADER: &str = "x-machine-id";

/// 명령 피드 인터페이스.
#[async_trait]
pub trait CommandFeed: Send + Sync {
    /// `watermark`보다 새로운 명령을 조회합니다. 순서는 보장되지 않습니다.
    async fn fetch_commands(&self, watermark: i64, correlation_id: &str) -> ExecutionResult<Vec<Command>>;

    /// 피드 이름 (로그용).
    fn source(&self) -> &str;
}

/// 등록 요청 본문.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub url: String,
    pub machine_id: String,
    pub nickname: String,
    pub subscribed_to: Vec<String>,
}

/// 코디네이터 클라이언트.
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    client: Client,
    base_url: String,
    feed_path: String,
    register_path: String,
    machine_id: Option<String>,
}

fn trim_trailing_slash(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

impl CoordinatorClient {
    /// 새 클라이언트 생성.
    ///
    /// # Errors
    /// HTTP 클라이언트 생성에 실패하면 `ExecutionError::FeedTransport`를 반환합니다.
    pub fn new(config: &CoordinatorConfig) -> ExecutionResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ExecutionError::FeedTransport(format!("HTTP 클라이언트 생성 실패: {}", e)))?;

        Ok(Self {
            client,
            base_url: trim_trailing_slash(&config.base_url),
            feed_path: trim_trailing_slash(&config.command_feed_path),
            register_path: config.register_path.clone(),
            machine_id: None,
        })
    }

    /// 요청에 머신 ID 헤더를 붙입니다.
    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 워터마크에 대한 명령 피드 URL.
    pub fn feed_url(&self, watermark: i64) -> String {
        format!("{}{}/{}", self.base_url, self.feed_path, watermark)
    }

    fn register_url(&self) -> String {
        format!("{}{}", self.base_url, self.register_path)
    }

    async fn check_status(response: reqwest::Response) -> ExecutionResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        // 코디네이터는 `{"message": "..."}` 형태로 사유를 보냄
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(ExecutionError::FeedStatus {
            status: status.as_u16(),
            message,
        })
    }

    /// 노드를 코디네이터에 등록합니다.
    pub async fn register(&self, registration: &Registration, correlation_id: &str) -> ExecutionResult<()> {
        let url = self.register_url();
        info!(%url, machine_id = %registration.machine_id, "Registering node");

        let response = self
            .client
            .post(&url)
            .header(COMMON_ID_HEADER, correlation_id)
            .json(registration)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl CommandFeed for CoordinatorClient {
    async fn fetch_commands(&self, watermark: i64, correlation_id: &str) -> ExecutionResult<Vec<Command>> {
        let url = self.feed_url(watermark);
        debug!(%url, "Fetching commands");

        let mut request = self.client.get(&url).header(COMMON_ID_HEADER, correlation_id);
        if let Some(machine_id) = &self.machine_id {
            request = request.header(MACHINE_ID_HEADER, machine_id);
        }

        let response = Self::check_status(request.send().await?).await?;
        let records: Vec<Value> = response.json().await?;

        let now = Utc::now().timestamp_millis();
        Ok(records
            .into_iter()
            .map(|record| Command::from_wire(record, now))
            .collect())
    }

    fn source(&self) -> &str {
        &self.base_url
    }
}

impl Registration {
    /// 노드 설정으로 등록 본문을 만듭니다.
    pub fn from_settings(node: &NodeSettings, coordinator: &CoordinatorConfig, machine_id: &str) -> Self {
        Self {
            url: trim_trailing_slash(&node.public_url),
            machine_id: machine_id.to_string(),
            nickname: node.nickname.clone(),
            subscribed_to: coordinator.subscribed_to.clone(),
        }
    }
}
