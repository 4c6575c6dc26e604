//! BingX 거래소 커넥터.
//!
//! BingX 무기한 선물(swap) REST API 구현. 모든 요청은 쿼리 문자열에
//! `timestamp`를 붙여 HMAC-SHA256으로 서명하고 `signature`를 덧붙입니다.
//! 포지션은 단방향(one-way) 모드를 전제로 합니다.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use node_core::{Asset, ExchangeSettings, Position, Side, WalletBalance};
use reqwest::{Client, Method};
use rust_decimal::prelude::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{debug, error, info};

use crate::traits::{Exchange, ExchangeResult};
use crate::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

const POSITION_SIDE: &str = "BOTH";

// ============================================================================
// 설정
// ============================================================================

/// BingX 클라이언트 설정.
///
/// `Debug` 구현은 `api_key`, `api_secret`을 마스킹합니다.
#[derive(Clone)]
pub struct BingxConfig {
    pub api_key: String,
    pub api_secret: String,
    /// 모의 거래(VST) 환경 사용
    pub testnet: bool,
    /// 요청 타임아웃 (초)
    pub timeout_secs: u64,
    /// 정산 코인 (심볼 접미사)
    pub settle_coin: String,
    /// REST URL 재정의 (테스트용)
    pub base_url: Option<String>,
}

impl fmt::Debug for BingxConfig {
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

        f.debug_struct("BingxConfig")
            .field("api_key", &masked_key)
            .field("api_secret", &"***REDACTED***")
            .field("testnet", &self.testnet)
            .field("settle_coin", &self.settle_coin)
            .finish()
    }
}

impl BingxConfig {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            testnet: false,
            timeout_secs: 30,
            settle_coin: "USDT".to_string(),
            base_url: None,
        }
    }

    pub fn from_settings(settings: &ExchangeSettings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            testnet: settings.testnet,
            timeout_secs: settings.timeout_secs,
            settle_coin: settings.settle_coin.clone(),
            base_url: None,
        }
    }

    /// REST URL 재정의.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn rest_base_url(&self) -> &str {
        match &self.base_url {
            Some(url) => url,
            None if self.testnet => "https://open-api-vst.bingx.com",
            None => "https://open-api.bingx.com",
        }
    }
}

// ============================================================================
// API 응답 타입
// ============================================================================

#[derive(Debug, Deserialize)]
struct BingxEnvelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct BingxTicker {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BingxBalance {
    asset: String,
    #[serde(default)]
    available_margin: String,
    #[serde(default)]
    equity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BingxPosition {
    symbol: String,
    position_side: String,
    position_amt: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    unrealized_profit: String,
    #[serde(default)]
    leverage: Value,
    #[serde(default)]
    update_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BingxContract {
    symbol: String,
    quantity_precision: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BingxOrderResult {
    #[serde(default)]
    order: Option<BingxOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BingxOrder {
    order_id: Value,
}

// ============================================================================
// BingX 클라이언트
// ============================================================================

/// BingX 거래소 클라이언트.
pub struct BingxClient {
    config: BingxConfig,
    client: Client,
    /// 심볼별 수량 소수 자릿수 캐시
    qty_precisions: RwLock<HashMap<String, u32>>,
    /// 단방향 포지션 모드 설정 여부
    one_way_mode: AtomicBool,
}

impl BingxClient {
    /// 새 BingX 클라이언트 생성.
    pub fn new(config: BingxConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ExchangeError::NetworkError(format!("HTTP 클라이언트 생성 실패: {}", e))
            })?;

        Ok(Self {
            config,
            client,
            qty_precisions: RwLock::new(HashMap::new()),
            one_way_mode: AtomicBool::new(false),
        })
    }

    /// "BTC" → "BTC-USDT".
    fn symbol(&self, asset: &Asset) -> String {
        format!("{}-{}", asset, self.config.settle_coin)
    }

    fn asset_of(&self, symbol: &str) -> Asset {
        let suffix = format!("-{}", self.config.settle_coin);
        Asset::new(symbol.strip_suffix(&suffix).unwrap_or(symbol))
    }

    fn sign(&self, query: &str) -> ExchangeResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.config.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Unauthorized(format!("Invalid API secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// 파라미터 순서를 유지하고 마지막에 `timestamp`를 붙입니다.
    fn build_query(params: &[(&str, String)], timestamp: i64) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(std::iter::once(format!("timestamp={}", timestamp)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// 서명된 요청. 파라미터는 GET/POST 모두 쿼리 문자열로 전달됩니다.
    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let query = Self::build_query(params, Utc::now().timestamp_millis());
        let signature = self.sign(&query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.config.rest_base_url(),
            path,
            query,
            signature
        );

        debug!("{} (signed) {}", method, path);

        let response = self
            .client
            .request(method, &url)
            .header("X-BX-APIKEY", &self.config.api_key)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> ExchangeResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited(body));
        }

        let envelope: BingxEnvelope = match serde_json::from_str(&body) {
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

        if envelope.code != 0 {
            return Err(Self::map_error_code(envelope.code, &envelope.msg));
        }

        serde_json::from_value(envelope.data).map_err(|e| {
            error!("Failed to parse data: {} - Body: {}", e, body);
            ExchangeError::ParseError(e.to_string())
        })
    }

    fn map_error_code(code: i64, msg: &str) -> ExchangeError {
        match code {
            100001 | 100413 | 100419 => ExchangeError::Unauthorized(msg.to_string()),
            100410 => ExchangeError::RateLimited(msg.to_string()),
            _ => ExchangeError::from_venue(code, msg),
        }
    }

    fn map_position(&self, raw: Value) -> ExchangeResult<Option<Position>> {
        let item: BingxPosition = serde_json::from_value(raw.clone())?;

        let amount = parse_decimal(&item.position_amt)?;
        if amount.is_zero() {
            return Ok(None);
        }

        let side = match item.position_side.to_uppercase().as_str() {
            "LONG" => Side::Buy,
            "SHORT" => Side::Sell,
            // 단방향 모드에서는 수량 부호가 방향
            "BOTH" if amount.is_sign_negative() => Side::Sell,
            "BOTH" => Side::Buy,
            other => {
                return Err(ExchangeError::ParseError(format!(
                    "Invalid side value received: {}",
                    other
                )))
            }
        };

        let avg_price = parse_decimal(&item.avg_price)?;
        let price = parse_optional(&item.mark_price)?.unwrap_or(avg_price);
        let leverage = match &item.leverage {
            Value::Number(n) => n.to_string().parse().unwrap_or(Decimal::ONE),
            Value::String(s) => parse_optional(s)?.unwrap_or(Decimal::ONE),
            _ => Decimal::ONE,
        };

        Ok(Some(Position {
            asset: self.asset_of(&item.symbol),
            symbol: item.symbol,
            side,
            price,
            avg_price,
            size: amount.abs(),
            pnl: parse_optional(&item.unrealized_profit)?.unwrap_or_default(),
            leverage,
            stop_loss: None,
            take_profit: None,
            profit_percent: Position::leveraged_percent_change(avg_price, price, side, leverage)
                .unwrap_or_default(),
            updated: item.update_time,
            raw,
        }))
    }

    /// 심볼의 수량 소수 자릿수 조회 (캐시됨).
    async fn qty_precision(&self, symbol: &str) -> ExchangeResult<u32> {
        let cached = match self.qty_precisions.read() {
            Ok(cache) => cache.get(symbol).copied(),
            Err(_) => None,
        };
        if let Some(precision) = cached {
            return Ok(precision);
        }

        let params = vec![("symbol", symbol.to_string())];
        let contracts: Vec<BingxContract> = self
            .signed_request(Method::GET, "/openApi/swap/v2/quote/contracts", &params)
            .await?;

        let precision = contracts
            .iter()
            .find(|c| c.symbol == symbol)
            .map(|c| c.quantity_precision)
            .ok_or_else(|| ExchangeError::ParseError(format!("Unknown contract: {}", symbol)))?;

        info!(symbol, precision, "Contract quantity precision cached");
        if let Ok(mut cache) = self.qty_precisions.write() {
            cache.insert(symbol.to_string(), precision);
        }
        Ok(precision)
    }

    /// 헤지 모드를 끄고 단방향 모드로 전환합니다. 프로세스당 한 번.
    async fn ensure_one_way_mode(&self) -> ExchangeResult<()> {
        if self.one_way_mode.load(Ordering::Acquire) {
            return Ok(());
        }
        let params = vec![("dualSidePosition", "false".to_string())];
        let _: Value = self
            .signed_request(Method::POST, "/openApi/swap/v1/positionSide/dual", &params)
            .await?;
        self.one_way_mode.store(true, Ordering::Release);
        Ok(())
    }

    async fn place_order(&self, params: Vec<(&str, String)>) -> ExchangeResult<String> {
        let result: BingxOrderResult = self
            .signed_request(Method::POST, "/openApi/swap/v2/trade/order", &params)
            .await?;
        Ok(result
            .order
            .map(|o| match o.order_id {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .unwrap_or_default())
    }

    async fn find_position(&self, symbol: &str) -> ExchangeResult<Option<Position>> {
        Ok(self.get_positions().await?.into_iter().find(|p| p.symbol == symbol))
    }
}

fn parse_decimal(value: &str) -> ExchangeResult<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|e| ExchangeError::ParseError(format!("invalid decimal '{}': {}", value, e)))
}

fn parse_optional(value: &str) -> ExchangeResult<Option<Decimal>> {
    if value.trim().is_empty() {
        Ok(None)
    } else {
        parse_decimal(value).map(Some)
    }
}

fn order_side(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

#[async_trait]
impl Exchange for BingxClient {
    fn name(&self) -> &str {
        "bingx"
    }

    async fn get_price(&self, asset: &Asset) -> ExchangeResult<Decimal> {
        let symbol = self.symbol(asset);
        let params = vec![("symbol", symbol.clone())];
        let ticker: BingxTicker = self
            .signed_request(Method::GET, "/openApi/swap/v1/ticker/price", &params)
            .await?;

        Decimal::from_str(&ticker.price)
            .map_err(|_| ExchangeError::ParseError(format!("Invalid price response for {}", symbol)))
    }

    async fn get_wallet_balance(&self) -> ExchangeResult<WalletBalance> {
        let balances: Vec<BingxBalance> = self
            .signed_request(Method::GET, "/openApi/swap/v3/user/balance", &[])
            .await?;

        let settle = balances
            .iter()
            .find(|b| b.asset == self.config.settle_coin)
            .ok_or_else(|| {
                ExchangeError::ParseError(format!(
                    "{} asset not found in BingX wallet.",
                    self.config.settle_coin
                ))
            })?;

        Ok(WalletBalance {
            available_amount: parse_optional(&settle.available_margin)?.unwrap_or_default(),
            total_amount: parse_optional(&settle.equity)?.unwrap_or_default(),
        })
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        let data: Value = self
            .signed_request(Method::GET, "/openApi/swap/v2/user/positions", &[])
            .await?;
        let Value::Array(list) = data else {
            return Ok(vec![]);
        };

        let mut positions = Vec::with_capacity(list.len());
        for raw in list {
            if let Some(position) = self.map_position(raw)? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn set_leverage(&self, asset: &Asset, leverage: Decimal) -> ExchangeResult<()> {
        self.ensure_one_way_mode().await?;

        let params = vec![
            ("leverage", leverage.normalize().to_string()),
            ("side", POSITION_SIDE.to_string()),
            ("symbol", self.symbol(asset)),
        ];
        let _: Value = self
            .signed_request(Method::POST, "/openApi/swap/v2/trade/leverage", &params)
            .await?;
        Ok(())
    }

    async fn normalize_quantity(&self, asset: &Asset, quantity: Decimal) -> ExchangeResult<Decimal> {
        let precision = self.qty_precision(&self.symbol(asset)).await?;
        Ok(quantity
            .round_dp_with_strategy(precision, RoundingStrategy::ToZero)
            .normalize())
    }

    async fn submit_market_order(
        &self,
        asset: &Asset,
        side: Side,
        quantity: Decimal,
    ) -> ExchangeResult<String> {
        let symbol = self.symbol(asset);
        let qty = quantity.normalize().to_string();
        info!(%symbol, %side, qty = %qty, "Placing market order");

        self.place_order(vec![
            ("symbol", symbol),
            ("side", order_side(side).to_string()),
            ("positionSide", POSITION_SIDE.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", qty),
        ])
        .await
    }

    /// 반대 방향 `STOP_MARKET` 주문으로 손절을 겁니다.
    async fn set_stop_loss(&self, asset: &Asset, price: Decimal) -> ExchangeResult<()> {
        let symbol = self.symbol(asset);
        let position = self
            .find_position(&symbol)
            .await?
            .ok_or_else(|| ExchangeError::PositionNotFound(format!("No open position found for {}.", symbol)))?;

        self.place_order(vec![
            ("symbol", symbol),
            ("side", order_side(position.side.opposite()).to_string()),
            ("positionSide", POSITION_SIDE.to_string()),
            ("type", "STOP_MARKET".to_string()),
            ("stopPrice", price.normalize().to_string()),
            ("quantity", position.size.normalize().to_string()),
        ])
        .await?;

        info!(%asset, %price, "Stop loss set");
        Ok(())
    }

    async fn close_position(&self, asset: &Asset, quantity: Option<Decimal>) -> ExchangeResult<()> {
        let symbol = self.symbol(asset);
        let Some(position) = self.find_position(&symbol).await? else {
            debug!(%symbol, "No open position to close");
            return Ok(());
        };

        let quantity = quantity.unwrap_or(position.size);
        self.place_order(vec![
            ("symbol", symbol.clone()),
            ("side", order_side(position.side.opposite()).to_string()),
            ("positionSide", POSITION_SIDE.to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("reduceOnly", "true".to_string()),
        ])
        .await?;

        info!(%symbol, %quantity, "Position close submitted");
        Ok(())
    }
}
