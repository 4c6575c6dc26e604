//! 자산 식별자와 거래 방향.

use serde::{Deserialize, Serialize};

/// 기본 결제 통화.
pub const DEFAULT_QUOTE: &str = "USDT";

/// 거래 가능한 자산 식별자 (예: "BTC").
///
/// 항상 대문자로 정규화됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub struct Asset(String);

impl Asset {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 거래소 심볼을 만듭니다 (예: "BTC" + "USDT" → "BTCUSDT").
    pub fn symbol(&self, quote: &str) -> String {
        format!("{}{}", self.0, quote)
    }

    /// 심볼에서 결제 통화 접미사를 제거해 자산을 얻습니다.
    pub fn from_symbol(symbol: &str, quote: &str) -> Self {
        let trimmed = symbol.strip_suffix(quote).unwrap_or(symbol);
        Self::new(trimmed)
    }
}

impl From<String> for Asset {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Asset {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Asset> for String {
    fn from(value: Asset) -> Self {
        value.0
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 포지션/주문 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// 롱
    #[serde(alias = "BUY", alias = "buy")]
    Buy,
    /// 숏
    #[serde(alias = "SELL", alias = "sell")]
    Sell,
}

impl Side {
    /// 반대 방향을 반환합니다.
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// 거래소 표기 ("Buy" / "Sell").
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "long" => Ok(Side::Buy),
            "sell" | "short" => Ok(Side::Sell),
            _ => Err(format!("Invalid side value received: {}", s)),
        }
    }
}
