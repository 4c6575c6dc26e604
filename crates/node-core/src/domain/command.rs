//! 코디네이터 명령.
//!
//! 명령 피드의 레코드는 수신 경계에서 한 번 디코딩되어 타입이 지정된
//! [`CommandKind`]로 바뀝니다. 이후 처리 단계는 JSON을 직접 다루지 않습니다.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use super::{Asset, Side};

/// 명령 피드의 원본 레코드.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCommand {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub parent_id: Option<Value>,
    #[serde(default, alias = "commonId")]
    pub correlation_id: Option<String>,
    #[serde(default, alias = "coin")]
    pub asset: Option<String>,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub created_timestamp: Option<i64>,
}

/// 디코딩된 명령.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// 노드 수명 동안 유일한 ID
    pub id: String,
    /// 먼저 완료되어야 하는 부모 명령 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// 코디네이터가 부여한 상관 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub asset: Asset,
    /// 정렬 키
    pub created_timestamp: i64,
    #[serde(flatten)]
    pub kind: CommandKind,
}

/// 명령 유형별 페이로드.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    SetStopLoss { price: Decimal },
    ClosePosition,
    SetSoftStopLoss { price: Decimal },
    SetPnlStopLoss { threshold: Option<Decimal> },
    OpenPosition(OpenPositionPayload),
    RestoreCommonIdForPosition,
    UpdateOnchainData,
    RestoreDataFromOnchain,
    SaveHistoricalPosition,
    /// 이 노드가 모르는 유형
    Unknown { command_type: String },
    /// 유형은 알지만 페이로드를 해석할 수 없음
    Malformed { command_type: String, reason: String },
}

/// `OPEN_POSITION` 페이로드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPositionPayload {
    /// 사용 가능 잔고 중 사용할 비율 (%)
    pub percentage: Decimal,
    pub side: Side,
    pub leverage: Decimal,
    /// 보호 손절 가격 (없으면 기본 비율 적용)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
}

impl OpenPositionPayload {
    /// 주문 수량: `available * (percentage * leverage / 100) / price`.
    ///
    /// 가격이 0 이하이면 `None`.
    pub fn quantity(&self, available: Decimal, price: Decimal) -> Option<Decimal> {
        if price <= Decimal::ZERO {
            return None;
        }
        let exposure = self.percentage * self.leverage / Decimal::ONE_HUNDRED;
        Some(available * exposure / price)
    }

    /// 보호 손절 가격. 페이로드 값이 우선합니다.
    pub fn protective_stop(&self, price: Decimal, default_pct: Decimal) -> Decimal {
        if let Some(stop) = self.stop_loss {
            return stop;
        }
        let offset = default_pct / Decimal::ONE_HUNDRED;
        match self.side {
            Side::Buy => price * (Decimal::ONE - offset),
            Side::Sell => price * (Decimal::ONE + offset),
        }
    }
}

impl CommandKind {
    /// 와이어 유형 문자열.
    pub fn command_type(&self) -> &str {
        match self {
            CommandKind::SetStopLoss { .. } => "SET_STOP_LOSS",
            CommandKind::ClosePosition => "CLOSE_POSITION",
            CommandKind::SetSoftStopLoss { .. } => "SET_SOFT_STOP_LOSS",
            CommandKind::SetPnlStopLoss { .. } => "SET_PNL_STOP_LOSS",
            CommandKind::OpenPosition(_) => "OPEN_POSITION",
            CommandKind::RestoreCommonIdForPosition => "RESTORE_COMMON_ID_FOR_POSITION",
            CommandKind::UpdateOnchainData => "UPDATE_ONCHAIN_DATA",
            CommandKind::RestoreDataFromOnchain => "RESTORE_DATA_FROM_ONCHAIN",
            CommandKind::SaveHistoricalPosition => "SAVE_HISTORICAL_POSITION",
            CommandKind::Unknown { command_type } => command_type,
            CommandKind::Malformed { command_type, .. } => command_type,
        }
    }

    /// 유형 문자열과 페이로드로부터 명령 종류를 만듭니다.
    pub fn decode(command_type: &str, payload: &Value) -> Self {
        let malformed = |reason: String| CommandKind::Malformed {
            command_type: command_type.to_string(),
            reason,
        };

        match command_type {
            "SET_STOP_LOSS" => match decimal_from_payload(payload, &["price", "stopLoss", "value"]) {
                Ok(Some(price)) => CommandKind::SetStopLoss { price },
                Ok(None) => malformed("missing stop loss price".into()),
                Err(e) => malformed(e),
            },
            "SET_SOFT_STOP_LOSS" => {
                match decimal_from_payload(payload, &["price", "stopLoss", "value"]) {
                    Ok(Some(price)) => CommandKind::SetSoftStopLoss { price },
                    Ok(None) => malformed("missing soft stop loss price".into()),
                    Err(e) => malformed(e),
                }
            }
            "SET_PNL_STOP_LOSS" => match decimal_from_payload(payload, &["threshold", "value", "pnl"]) {
                Ok(threshold) => CommandKind::SetPnlStopLoss { threshold },
                Err(e) => malformed(e),
            },
            "CLOSE_POSITION" => CommandKind::ClosePosition,
            "OPEN_POSITION" => match OpenPositionPayload::deserialize(payload) {
                Ok(p) if p.percentage <= Decimal::ZERO => {
                    malformed(format!("percentage must be positive: {}", p.percentage))
                }
                Ok(p) if p.leverage <= Decimal::ZERO => {
                    malformed(format!("leverage must be positive: {}", p.leverage))
                }
                Ok(p) => CommandKind::OpenPosition(p),
                Err(e) => malformed(e.to_string()),
            },
            "RESTORE_COMMON_ID_FOR_POSITION" => CommandKind::RestoreCommonIdForPosition,
            "UPDATE_ONCHAIN_DATA" => CommandKind::UpdateOnchainData,
            "RESTORE_DATA_FROM_ONCHAIN" => CommandKind::RestoreDataFromOnchain,
            "SAVE_HISTORICAL_POSITION" => CommandKind::SaveHistoricalPosition,
            other => CommandKind::Unknown {
                command_type: other.to_string(),
            },
        }
    }
}

/// 숫자, 숫자 문자열, 또는 `keys` 중 하나를 가진 객체에서 Decimal을 꺼냅니다.
/// `null`이나 키가 없는 객체는 `None`입니다.
fn decimal_from_payload(payload: &Value, keys: &[&str]) -> Result<Option<Decimal>, String> {
    match payload {
        Value::Null => Ok(None),
        Value::Number(n) => parse_decimal(&n.to_string()).map(Some),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse_decimal(s).map(Some),
        Value::Object(map) => match keys.iter().find_map(|k| map.get(*k)) {
            Some(Value::Object(_)) | None => Ok(None),
            Some(inner) => decimal_from_payload(inner, keys),
        },
        other => Err(format!("unexpected payload: {}", other)),
    }
}

fn parse_decimal(s: &str) -> Result<Decimal, String> {
    let s = s.trim();
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|e| format!("invalid decimal '{}': {}", s, e))
}

fn id_from_value(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl RawCommand {
    /// 타입이 지정된 명령으로 변환합니다.
    ///
    /// `id`가 없으면 UUID v4를, `createdTimestamp`가 없으면 `now_ms`를 사용합니다.
    pub fn into_command(self, now_ms: i64) -> Command {
        let kind = CommandKind::decode(&self.command_type, &self.payload);
        Command {
            id: id_from_value(self.id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            parent_id: id_from_value(self.parent_id),
            correlation_id: self.correlation_id.filter(|c| !c.is_empty()),
            asset: Asset::new(self.asset.unwrap_or_default()),
            created_timestamp: self.created_timestamp.unwrap_or(now_ms),
            kind,
        }
    }
}

impl Command {
    /// 피드의 JSON 레코드 하나를 디코딩합니다.
    ///
    /// 레코드 구조 자체가 잘못된 경우에도 배치를 중단하지 않도록
    /// `Malformed` 명령을 만들어 반환합니다.
    pub fn from_wire(value: Value, now_ms: i64) -> Self {
        match RawCommand::deserialize(&value) {
            Ok(raw) => raw.into_command(now_ms),
            Err(e) => Command {
                id: id_from_value(value.get("id").cloned())
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                parent_id: None,
                correlation_id: None,
                asset: Asset::default(),
                created_timestamp: value
                    .get("createdTimestamp")
                    .and_then(Value::as_i64)
                    .unwrap_or(now_ms),
                kind: CommandKind::Malformed {
                    command_type: value
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("UNKNOWN")
                        .to_string(),
                    reason: e.to_string(),
                },
            },
        }
    }

    pub fn command_type(&self) -> &str {
        self.kind.command_type()
    }

    /// 텔레메트리 페이로드용 JSON.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_decode_wire_aliases() {
        let cmd = Command::from_wire(
            json!({
                "id": "c-1",
                "commonId": "corr-9",
                "coin": "btc",
                "type": "SET_STOP_LOSS",
                "payload": 41000.5,
                "createdTimestamp": 1700000000000i64
            }),
            0,
        );

        assert_eq!(cmd.id, "c-1");
        assert_eq!(cmd.correlation_id.as_deref(), Some("corr-9"));
        assert_eq!(cmd.asset, Asset::new("BTC"));
        assert_eq!(cmd.created_timestamp, 1_700_000_000_000);
        assert_eq!(cmd.kind, CommandKind::SetStopLoss { price: dec!(41000.5) });
    }

    #[test]
    fn test_stop_loss_object_payload() {
        let kind = CommandKind::decode("SET_SOFT_STOP_LOSS", &json!({"price": "40000"}));
        assert_eq!(kind, CommandKind::SetSoftStopLoss { price: dec!(40000) });
    }

    #[test]
    fn test_pnl_null_disables() {
        assert_eq!(
            CommandKind::decode("SET_PNL_STOP_LOSS", &Value::Null),
            CommandKind::SetPnlStopLoss { threshold: None }
        );
        assert_eq!(
            CommandKind::decode("SET_PNL_STOP_LOSS", &json!(-50)),
            CommandKind::SetPnlStopLoss { threshold: Some(dec!(-50)) }
        );
    }

    #[test]
    fn test_missing_id_and_timestamp() {
        let cmd = Command::from_wire(json!({"coin": "ETH", "type": "CLOSE_POSITION"}), 42);
        assert!(Uuid::parse_str(&cmd.id).is_ok());
        assert_eq!(cmd.created_timestamp, 42);
        assert_eq!(cmd.kind, CommandKind::ClosePosition);
    }

    #[test]
    fn test_unknown_and_malformed() {
        let unknown = CommandKind::decode("TELEPORT", &Value::Null);
        assert_eq!(unknown.command_type(), "TELEPORT");
        assert!(matches!(unknown, CommandKind::Unknown { .. }));

        let bad = CommandKind::decode("OPEN_POSITION", &json!({"side": "Buy"}));
        assert!(matches!(bad, CommandKind::Malformed { .. }));

        let broken = Command::from_wire(json!({"type": 5}), 7);
        assert!(matches!(broken.kind, CommandKind::Malformed { .. }));
    }

    #[test]
    fn test_open_position_quantity() {
        let payload = OpenPositionPayload {
            percentage: dec!(10),
            side: Side::Buy,
            leverage: dec!(5),
            stop_loss: None,
        };
        assert_eq!(payload.quantity(dec!(1000), dec!(50000)), Some(dec!(0.01)));
        assert_eq!(payload.quantity(dec!(1000), Decimal::ZERO), None);
    }

    #[test]
    fn test_protective_stop() {
        let mut payload = OpenPositionPayload {
            percentage: dec!(10),
            side: Side::Buy,
            leverage: dec!(5),
            stop_loss: None,
        };
        assert_eq!(payload.protective_stop(dec!(50000), dec!(4)), dec!(48000));

        payload.side = Side::Sell;
        assert_eq!(payload.protective_stop(dec!(50000), dec!(4)), dec!(52000));

        payload.stop_loss = Some(dec!(51000));
        assert_eq!(payload.protective_stop(dec!(50000), dec!(4)), dec!(51000));
    }

    #[test]
    fn test_open_position_payload_from_wire() {
        let cmd = Command::from_wire(
            json!({
                "id": 3,
                "parentId": "1",
                "coin": "SOL",
                "type": "OPEN_POSITION",
                "payload": {"percentage": 10, "side": "Sell", "leverage": 3, "stopLoss": 120.5},
                "createdTimestamp": 5
            }),
            0,
        );
        assert_eq!(cmd.id, "3");
        assert_eq!(cmd.parent_id.as_deref(), Some("1"));
        match cmd.kind {
            CommandKind::OpenPosition(p) => {
                assert_eq!(p.side, Side::Sell);
                assert_eq!(p.stop_loss, Some(dec!(120.5)));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
