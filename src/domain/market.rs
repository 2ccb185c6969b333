use std::collections::HashMap;

use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Venue identifier, e.g. "binance"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(pub String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Token pair identifier, e.g. "KNC-ETH"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenPairId(pub String);

impl TokenPairId {
    pub fn new(base: &str, quote: &str) -> Self {
        Self(format!("{}-{}", base, quote))
    }
}

impl std::fmt::Display for TokenPairId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Price level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceEntry {
    pub quantity: Decimal,
    pub rate: Decimal,
}

/// Order book of one pair on one venue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangePrice {
    pub valid: bool,
    #[serde(default)]
    pub error: String,
    pub timestamp: u64,
    pub return_time: u64,
    pub bids: Vec<PriceEntry>,
    pub asks: Vec<PriceEntry>,
}

pub type OnePrice = HashMap<ExchangeId, ExchangePrice>;

/// Order books across all venues for one fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllPriceEntry {
    pub block: u64,
    pub data: HashMap<TokenPairId, OnePrice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllPriceResponse {
    pub version: u64,
    pub timestamp: u64,
    pub return_time: u64,
    pub data: HashMap<TokenPairId, OnePrice>,
    pub block: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnePriceResponse {
    pub version: u64,
    pub timestamp: u64,
    pub return_time: u64,
    pub data: OnePrice,
}

/// On-chain rate of one token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateEntry {
    pub base_buy: U256,
    pub compact_buy: i8,
    pub base_sell: U256,
    pub compact_sell: i8,
    pub block: u64,
}

/// Rates of every listed token read in one fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllRateEntry {
    pub valid: bool,
    #[serde(default)]
    pub error: String,
    pub timestamp: u64,
    pub return_time: u64,
    pub data: HashMap<String, RateEntry>,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateResponse {
    pub valid: bool,
    pub error: String,
    pub timestamp: u64,
    pub return_time: u64,
    pub base_buy: f64,
    pub compact_buy: i8,
    pub base_sell: f64,
    pub compact_sell: i8,
    pub rate: f64,
    pub block: u64,
}

impl RateResponse {
    pub fn from_entry(all: &AllRateEntry, entry: &RateEntry) -> Self {
        Self {
            valid: all.valid,
            error: all.error.clone(),
            timestamp: all.timestamp,
            return_time: all.return_time,
            base_buy: wei_to_float(entry.base_buy),
            compact_buy: entry.compact_buy,
            base_sell: wei_to_float(entry.base_sell),
            compact_sell: entry.compact_sell,
            rate: 0.0,
            block: entry.block,
        }
    }

    fn same_rate(&self, other: &RateResponse) -> bool {
        self.base_buy == other.base_buy
            && self.compact_buy == other.compact_buy
            && self.base_sell == other.base_sell
            && self.compact_sell == other.compact_sell
            && self.rate == other.rate
    }
}

/// Rate set served upward; `block_number..=to_block_number` is the span over
/// which the rates stayed unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllRateResponse {
    pub version: u64,
    pub valid: bool,
    pub error: String,
    pub timestamp: u64,
    pub return_time: u64,
    pub data: HashMap<String, RateResponse>,
    pub block_number: u64,
    pub to_block_number: u64,
}

/// True when every token of `old` has an identical rate in `new`
pub fn rates_duplicated(
    old: &HashMap<String, RateResponse>,
    new: &HashMap<String, RateResponse>,
) -> bool {
    old.iter()
        .all(|(token, rate)| new.get(token).is_some_and(|n| rate.same_rate(n)))
}

pub fn wei_to_float(amount: U256) -> f64 {
    ethers::utils::format_units(amount, 18u32)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeHistory {
    pub id: String,
    pub price: Decimal,
    pub qty: Decimal,
    #[serde(rename = "type")]
    pub side: String,
    pub timestamp: u64,
}

pub type ExchangeTradeHistory = HashMap<TokenPairId, Vec<TradeHistory>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllTradeHistory {
    pub timestamp: u64,
    pub data: HashMap<ExchangeId, ExchangeTradeHistory>,
}

/// Up/down flag of one venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExStatus {
    pub timestamp: u64,
    pub status: bool,
}

pub type ExchangesStatus = HashMap<String, ExStatus>;
