//! 텔레메트리 인터페이스.
//!
//! 각 컴포넌트는 `Arc<dyn Telemetry>`를 명시적으로 주입받아 이벤트를 보고합니다.
//! 기록은 실패하지 않으며 호출자를 막지 않습니다.

use serde_json::Value;
use std::sync::Mutex;

/// 텔레메트리 레벨.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryLevel {
    Info,
    Warn,
    Error,
}

/// 노드 이벤트 보고 인터페이스.
pub trait Telemetry: Send + Sync {
    /// 정보 이벤트를 기록합니다.
    fn log_info(&self, correlation_id: &str, message: &str, payload: Option<&Value>);

    /// 경고 이벤트를 기록합니다.
    fn log_warn(&self, correlation_id: &str, message: &str, payload: Option<&Value>);

    /// 에러 이벤트를 기록합니다.
    fn log_error(&self, correlation_id: &str, message: &str, payload: Option<&Value>);
}

/// `tracing` 이벤트로 내보내는 텔레메트리.
#[derive(Debug, Clone)]
pub struct TracingTelemetry {
    application_name: String,
    machine_id: String,
}

impl TracingTelemetry {
    pub fn new(application_name: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            machine_id: machine_id.into(),
        }
    }
}

fn render(payload: Option<&Value>) -> String {
    payload.map(Value::to_string).unwrap_or_default()
}

impl Telemetry for TracingTelemetry {
    fn log_info(&self, correlation_id: &str, message: &str, payload: Option<&Value>) {
        tracing::info!(
            correlation_id,
            app = %self.application_name,
            machine = %self.machine_id,
            payload = %render(payload),
            "{}",
            message
        );
    }

    fn log_warn(&self, correlation_id: &str, message: &str, payload: Option<&Value>) {
        tracing::warn!(
            correlation_id,
            app = %self.application_name,
            machine = %self.machine_id,
            payload = %render(payload),
            "{}",
            message
        );
    }

    fn log_error(&self, correlation_id: &str, message: &str, payload: Option<&Value>) {
        tracing::error!(
            correlation_id,
            app = %self.application_name,
            machine = %self.machine_id,
            payload = %render(payload),
            "{}",
            message
        );
    }
}

/// 기록된 텔레메트리 항목.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEntry {
    pub level: TelemetryLevel,
    pub correlation_id: String,
    pub message: String,
    pub payload: Option<Value>,
}

/// 메모리에 항목을 쌓는 텔레메트리.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    entries: Mutex<Vec<TelemetryEntry>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 지금까지 기록된 항목의 복사본.
    pub fn entries(&self) -> Vec<TelemetryEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// 메시지에 `needle`이 포함된 항목 수.
    pub fn count_containing(&self, level: TelemetryLevel, needle: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.level == level && e.message.contains(needle))
            .count()
    }

    fn push(&self, level: TelemetryLevel, correlation_id: &str, message: &str, payload: Option<&Value>) {
        // poison 상태면 기록을 버림
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(TelemetryEntry {
                level,
                correlation_id: correlation_id.to_string(),
                message: message.to_string(),
                payload: payload.cloned(),
            });
        }
    }
}

impl Telemetry for MemoryTelemetry {
    fn log_info(&self, correlation_id: &str, message: &str, payload: Option<&Value>) {
        self.push(TelemetryLevel::Info, correlation_id, message, payload);
    }

    fn log_warn(&self, correlation_id: &str, message: &str, payload: Option<&Value>) {
        self.push(TelemetryLevel::Warn, correlation_id, message, payload);
    }

    fn log_error(&self, correlation_id: &str, message: &str, payload: Option<&Value>) {
        self.push(TelemetryLevel::Error, correlation_id, message, payload);
    }
}
