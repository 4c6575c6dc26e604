//! Bybit 거래소 커넥터.
//!
//! Bybit v5 REST API의 USDT 무기한(linear) 상품용 구현.
//! 메인넷과 테스트넷 모두 지원.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use node_core::{Asset, ClosedPosition, ExchangeSettings, Position, Side, WalletBalance};
use reqwest::Client;
use rust_decimal::prelude::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::traits::{floor_to_step, Exchange, ExchangeResult};
use crate::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

const CATEGORY: &str = "linear";
/// 주문 수량의 시작 소수 자릿수.
const ORDER_QTY_PRECISION: u32 = 3;
/// `Qty invalid` 응답 시 자릿수를 줄여 재시도하는 최대 횟수.
const ORDER_QTY_RETRIES: u32 = 3;
const QTY_INVALID: &str = "Qty invalid";

// ============================================================================
// 설정
// ============================================================================

/// Bybit 클라이언트 설정.
///
/// `Debug` 구현은 `api_key`, `api_secret`을 마스킹합니다.
#[derive(Clone)]
pub struct BybitConfig {
    pub api_key: String,
    pub api_secret: String,
    /// 테스트넷 사용
    pub testnet: bool,
    /// 요청 타임아웃 (초)
    pub timeout_secs: u64,
    /// 수신 윈도우 (밀리초)
    pub recv_window: u64,
    /// 정산 코인 (심볼 접미사)
    pub settle_coin: String,
    /// REST URL 재정의 (테스트용)
    pub base_url: Option<String>,
}

impl fmt::Debug for BybitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masked_key = if self.api_key.len() > 8 {
            format!(
                "{}...{}",
                &self.api_key[..4],
                &self.api_key[self.api_key.len() - 4..]
            )
        } else {
            "***REDACTED***".to_string()
        };

        f.debug_struct("BybitConfig")
            .field("api_key", &masked_key)
            .field("api_secret", &"***REDACTED***")
            .field("testnet", &self.testnet)
            .field("recv_window", &self.recv_window)
            .field("settle_coin", &self.settle_coin)
            .field("base_url", &self.rest_base_url())
            .finish()
    }
}

impl BybitConfig {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            testnet: false,
            timeout_secs: 30,
            recv_window: 5000,
            settle_coin: "USDT".to_string(),
            base_url: None,
        }
    }

    /// 노드 설정의 `[exchange]` 섹션으로부터 생성.
    pub fn from_settings(settings: &ExchangeSettings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            testnet: settings.testnet,
            timeout_secs: settings.timeout_secs,
            recv_window: settings.recv_window,
            settle_coin: settings.settle_coin.clone(),
            base_url: None,
        }
    }

    /// 테스트넷 사용.
    pub fn with_testnet(mut self, testnet: bool) -> Self {
        self.testnet = testnet;
        self
    }

    /// REST URL 재정의.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// REST API 기본 URL 반환.
    pub fn rest_base_url(&self) -> &str {
        match &self.base_url {
            Some(url) => url,
            None if self.testnet => "https://api-testnet.bybit.com",
            None => "https://api.bybit.com",
        }
    }
}

// ============================================================================
// API 응답 타입
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitEnvelope {
    ret_code: i64,
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct BybitList<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    mark_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitWallet {
    #[serde(default)]
    total_available_balance: String,
    #[serde(default)]
    total_equity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitPosition {
    symbol: String,
    side: String,
    size: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    unrealised_pnl: String,
    #[serde(default)]
    leverage: String,
    #[serde(default)]
    take_profit: String,
    #[serde(default)]
    stop_loss: String,
    #[serde(default)]
    updated_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitClosedPnl {
    symbol: String,
    side: String,
    qty: String,
    avg_entry_price: String,
    avg_exit_price: String,
    closed_pnl: String,
    #[serde(default)]
    leverage: String,
    #[serde(default)]
    updated_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitInstrument {
    lot_size_filter: BybitLotSizeFilter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitLotSizeFilter {
    qty_step: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrderResult {
    #[serde(default)]
    order_id: String,
}

// ============================================================================
// Bybit 클라이언트
// ============================================================================

/// Bybit 거래소 클라이언트.
pub struct BybitClient {
    config: BybitConfig,
    client: Client,
    /// 심볼별 수량 단위 캐시
    qty_steps: RwLock<HashMap<String, Decimal>>,
}

impl BybitClient {
    /// 새 Bybit 클라이언트 생성.
    ///
    /// # Errors
    /// HTTP 클라이언트 생성에 실패하면 `ExchangeError::NetworkError`를 반환합니다.
    pub fn new(config: BybitConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ExchangeError::NetworkError(format!("HTTP 클라이언트 생성 실패: {}", e))
            })?;

        Ok(Self {
            config,
            client,
            qty_steps: RwLock::new(HashMap::new()),
        })
    }

    fn symbol(&self, asset: &Asset) -> String {
        asset.symbol(&self.config.settle_coin)
    }

    /// `timestamp + api_key + recv_window + payload`를 HMAC-SHA256으로 서명.
    fn sign(&self, timestamp: i64, payload: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Unauthorized(format!("Invalid API secret: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(self.config.api_key.as_bytes());
        mac.update(self.config.recv_window.to_string().as_bytes());
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn build_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn auth_headers(
        &self,
        request: reqwest::RequestBuilder,
        payload: &str,
    ) -> ExchangeResult<reqwest::RequestBuilder> {
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, payload)?;

        Ok(request
            .header("X-BAPI-API-KEY", &self.config.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.config.recv_window.to_string())
            .header("X-BAPI-SIGN", signature))
    }

    /// 서명된 GET 요청.
    async fn signed_get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let query = Self::build_query(params);
        let url = format!("{}{}?{}", self.config.rest_base_url(), endpoint, query);

        debug!("GET (signed) {}", endpoint);

        let request = self.auth_headers(self.client.get(&url), &query)?;
        let response = request.send().await?;
        self.handle_response(response).await
    }

    /// 서명된 POST 요청 (JSON 본문).
    async fn signed_post<T: DeserializeOwned>(&self, endpoint: &str, body: &Value) -> ExchangeResult<T> {
        let url = format!("{}{}", self.config.rest_base_url(), endpoint);
        let body = body.to_string();

        debug!("POST (signed) {} {}", endpoint, body);

        let request = self
            .auth_headers(self.client.post(&url), &body)?
            .header("Content-Type", "application/json")
            .body(body);
        let response = request.send().await?;
        self.handle_response(response).await
    }

    /// API 응답 처리.
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> ExchangeResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited(body));
        }

        let envelope: BybitEnvelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                error!("Failed to parse response: {} - Body: {}", e, body);
                return Err(ExchangeError::ParseError(e.to_string()));
            }
            Err(_) => {
                return Err(ExchangeError::ApiError {
                    code: i64::from(status.as_u16()),
                    message: body,
                })
            }
        };

        if envelope.ret_code != 0 {
            return Err(Self::map_error_code(envelope.ret_code, &envelope.ret_msg));
        }

        serde_json::from_value(envelope.result).map_err(|e| {
            error!("Failed to parse result: {} - Body: {}", e, body);
            ExchangeError::ParseError(e.to_string())
        })
    }

    /// Bybit 에러 코드를 ExchangeError로 매핑.
    fn map_error_code(code: i64, msg: &str) -> ExchangeError {
        if msg.trim() == QTY_INVALID {
            return ExchangeError::InvalidQuantity(msg.to_string());
        }
        match code {
            10003 | 10004 | 10005 | 10007 => ExchangeError::Unauthorized(msg.to_string()),
            10006 | 10018 => ExchangeError::RateLimited(msg.to_string()),
            _ => ExchangeError::from_venue(code, msg),
        }
    }

    /// 거래소 포지션 응답을 도메인 포지션으로 변환합니다.
    ///
    /// 수량이 0이거나 방향이 없는 항목은 `None`.
    fn map_position(&self, raw: Value) -> ExchangeResult<Option<Position>> {
        let item: BybitPosition = serde_json::from_value(raw.clone())?;

        let side = match item.side.as_str() {
            "Buy" => Side::Buy,
            "Sell" => Side::Sell,
            "" | "None" => return Ok(None),
            other => {
                return Err(ExchangeError::ParseError(format!(
                    "Invalid side value received: {}",
                    other
                )))
            }
        };

        let size = parse_decimal(&item.size)?;
        if size.is_zero() {
            return Ok(None);
        }

        let price = parse_decimal(&item.mark_price)?;
        let avg_price = parse_decimal(&item.avg_price)?;
        let leverage = parse_optional(&item.leverage)?.unwrap_or(Decimal::ONE);

        Ok(Some(Position {
            asset: Asset::from_symbol(&item.symbol, &self.config.settle_coin),
            symbol: item.symbol,
            side,
            price,
            avg_price,
            size,
            pnl: parse_optional(&item.unrealised_pnl)?.unwrap_or_default(),
            leverage,
            stop_loss: parse_optional(&item.stop_loss)?.filter(|v| !v.is_zero()),
            take_profit: parse_optional(&item.take_profit)?.filter(|v| !v.is_zero()),
            profit_percent: Position::leveraged_percent_change(avg_price, price, side, leverage)
                .unwrap_or_default(),
            updated: item.updated_time.parse().unwrap_or(0),
            raw,
        }))
    }

    /// 심볼의 수량 단위 조회 (캐시됨).
    async fn qty_step(&self, symbol: &str) -> ExchangeResult<Decimal> {
        let cached = match self.qty_steps.read() {
            Ok(cache) => cache.get(symbol).copied(),
            Err(_) => None,
        };
        if let Some(step) = cached {
            return Ok(step);
        }

        let params = vec![("category", CATEGORY.to_string()), ("symbol", symbol.to_string())];
        let resp: BybitList<BybitInstrument> =
            self.signed_get("/v5/market/instruments-info", &params).await?;

        let step = match resp.list.first() {
            Some(instrument) => parse_decimal(&instrument.lot_size_filter.qty_step)?,
            None => Decimal::ONE,
        };

        info!(symbol, %step, "Instrument quantity step cached");
        if let Ok(mut cache) = self.qty_steps.write() {
            cache.insert(symbol.to_string(), step);
        }
        Ok(step)
    }

    /// 소수 자릿수를 줄여가며 시장가 주문을 제출합니다.
    async fn submit_order_with_precision(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
    ) -> ExchangeResult<String> {
        let mut precision = ORDER_QTY_PRECISION;
        let mut retries = ORDER_QTY_RETRIES;

        loop {
            let qty = format_qty(quantity, precision);
            let mut body = json!({
                "category": CATEGORY,
                "symbol": symbol,
                "side": side.as_str(),
                "orderType": "Market",
                "qty": qty,
            });
            if reduce_only {
                body["reduceOnly"] = Value::Bool(true);
            }

            info!(symbol, %side, qty = %qty, "Placing market order");

            match self.signed_post::<BybitOrderResult>("/v5/order/create", &body).await {
                Ok(result) => return Ok(result.order_id),
                Err(ExchangeError::InvalidQuantity(msg)) if precision > 0 => {
                    if retries == 0 {
                        return Err(ExchangeError::InvalidQuantity(format!(
                            "Failed to submit order after multiple attempts: {}",
                            msg
                        )));
                    }
                    warn!(symbol, qty = %qty, precision, "Qty invalid, retrying with lower precision");
                    precision -= 1;
                    retries -= 1;
                }
                Err(e) => {
                    error!(symbol, %side, qty = %qty, error = %e, "Failed to submit order");
                    return Err(e);
                }
            }
        }
    }
}

fn parse_decimal(value: &str) -> ExchangeResult<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|e| ExchangeError::ParseError(format!("invalid decimal '{}': {}", value, e)))
}

/// 빈 문자열은 `None`.
fn parse_optional(value: &str) -> ExchangeResult<Option<Decimal>> {
    if value.trim().is_empty() {
        Ok(None)
    } else {
        parse_decimal(value).map(Some)
    }
}

/// 수량을 `precision` 자릿수로 반올림하고 뒤쪽 0을 제거합니다.
fn format_qty(quantity: Decimal, precision: u32) -> String {
    quantity
        .round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
        .to_string()
}

#[async_trait]
impl Exchange for BybitClient {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn get_price(&self, asset: &Asset) -> ExchangeResult<Decimal> {
        let symbol = self.symbol(asset);
        let params = vec![("category", CATEGORY.to_string()), ("symbol", symbol.clone())];
        let resp: BybitList<BybitTicker> = self.signed_get("/v5/market/tickers", &params).await?;

        resp.list
            .first()
            .and_then(|t| Decimal::from_str(&t.mark_price).ok())
            .ok_or_else(|| ExchangeError::ParseError(format!("Invalid price received for {}", symbol)))
    }

    async fn get_wallet_balance(&self) -> ExchangeResult<WalletBalance> {
        let params = vec![
            ("accountType", "UNIFIED".to_string()),
            ("coin", self.config.settle_coin.clone()),
        ];
        let resp: BybitList<BybitWallet> =
            self.signed_get("/v5/account/wallet-balance", &params).await?;

        let wallet = resp
            .list
            .first()
            .ok_or_else(|| ExchangeError::ParseError("Invalid wallet balance response.".into()))?;

        Ok(WalletBalance {
            available_amount: parse_optional(&wallet.total_available_balance)?.unwrap_or_default(),
            total_amount: parse_optional(&wallet.total_equity)?.unwrap_or_default(),
        })
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        let params = vec![
            ("category", CATEGORY.to_string()),
            ("settleCoin", self.config.settle_coin.clone()),
        ];
        let resp: BybitList<Value> = self.signed_get("/v5/position/list", &params).await?;

        let mut positions = Vec::with_capacity(resp.list.len());
        for raw in resp.list {
            if let Some(position) = self.map_position(raw)? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn get_positions_history(&self) -> ExchangeResult<Vec<ClosedPosition>> {
        let start_time = Utc::now().timestamp_millis() - 60 * 60_000;
        let params = vec![
            ("category", CATEGORY.to_string()),
            ("startTime", start_time.to_string()),
        ];
        let resp: BybitList<BybitClosedPnl> =
            self.signed_get("/v5/position/closed-pnl", &params).await?;

        resp.list
            .into_iter()
            .map(|item| -> ExchangeResult<ClosedPosition> {
                let side = item
                    .side
                    .parse::<Side>()
                    .map_err(ExchangeError::ParseError)?;
                Ok(ClosedPosition {
                    asset: Asset::from_symbol(&item.symbol, &self.config.settle_coin),
                    symbol: item.symbol,
                    side,
                    size: parse_decimal(&item.qty)?,
                    avg_entry_price: parse_decimal(&item.avg_entry_price)?,
                    avg_exit_price: parse_decimal(&item.avg_exit_price)?,
                    closed_pnl: parse_decimal(&item.closed_pnl)?,
                    leverage: parse_optional(&item.leverage)?.unwrap_or(Decimal::ONE),
                    closed_at: item.updated_time.parse().unwrap_or(0),
                })
            })
            .collect()
    }

    async fn set_leverage(&self, asset: &Asset, leverage: Decimal) -> ExchangeResult<()> {
        let leverage = leverage.normalize().to_string();
        let body = json!({
            "category": CATEGORY,
            "symbol": self.symbol(asset),
            "buyLeverage": leverage,
            "sellLeverage": leverage,
        });

        match self.signed_post::<Value>("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            // 이미 같은 레버리지
            Err(ExchangeError::ApiError { code: 110043, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn normalize_quantity(&self, asset: &Asset, quantity: Decimal) -> ExchangeResult<Decimal> {
        let step = self.qty_step(&self.symbol(asset)).await?;
        Ok(floor_to_step(quantity, step))
    }

    async fn submit_market_order(
        &self,
        asset: &Asset,
        side: Side,
        quantity: Decimal,
    ) -> ExchangeResult<String> {
        self.submit_order_with_precision(&self.symbol(asset), side, quantity, false)
            .await
    }

    async fn set_stop_loss(&self, asset: &Asset, price: Decimal) -> ExchangeResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": self.symbol(asset),
            "stopLoss": price.normalize().to_string(),
            "slTriggerBy": "MarkPrice",
            "positionIdx": 0,
        });

        let _: Value = self.signed_post("/v5/position/trading-stop", &body).await?;
        info!(%asset, %price, "Stop loss set");
        Ok(())
    }

    async fn close_position(&self, asset: &Asset, quantity: Option<Decimal>) -> ExchangeResult<()> {
        let symbol = self.symbol(asset);
        let positions = self.get_positions().await?;

        let Some(position) = positions.iter().find(|p| p.symbol == symbol) else {
            debug!(%symbol, "No open position to close");
            return Ok(());
        };

        let quantity = quantity.unwrap_or(position.size);
        self.submit_order_with_precision(&symbol, position.side.opposite(), quantity, true)
            .await?;

        info!(%symbol, %quantity, "Position close submitted");
        Ok(())
    }
}
