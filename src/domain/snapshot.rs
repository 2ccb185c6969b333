use std::collections::HashMap;

use ethers::types::U256;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::activity::ActivityRecord;
use super::market::ExchangeId;

/// Storage-assigned, monotonically increasing version of a committed record
pub type Version = u64;

/// Balances reported by one venue in one fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EBalanceEntry {
    pub valid: bool,
    #[serde(default)]
    pub error: String,
    pub timestamp: u64,
    pub return_time: u64,
    #[serde(default)]
    pub available_balance: HashMap<String, Decimal>,
    #[serde(default)]
    pub locked_balance: HashMap<String, Decimal>,
    #[serde(default)]
    pub deposit_balance: HashMap<String, Decimal>,
    /// Venue reachability as seen by the last fetch
    #[serde(default)]
    pub status: bool,
}

impl EBalanceEntry {
    /// Entry standing in for a venue whose balance fetch failed
    pub fn failed(error: impl Into<String>, timestamp: u64) -> Self {
        Self {
            valid: false,
            error: error.into(),
            timestamp,
            return_time: timestamp,
            status: false,
            ..Default::default()
        }
    }

    /// Copy of `previous` balances stamped with this cycle's failure
    pub fn carried_forward(previous: &EBalanceEntry, failure: &EBalanceEntry) -> Self {
        Self {
            valid: false,
            error: failure.error.clone(),
            status: false,
            ..previous.clone()
        }
    }
}

/// One token balance held by the reserve contract, raw base units
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub valid: bool,
    #[serde(default)]
    pub error: String,
    pub timestamp: u64,
    pub return_time: u64,
    pub balance: U256,
}

impl BalanceEntry {
    /// Balance scaled down by the token's decimals
    pub fn to_balance_response(&self, decimals: u32) -> BalanceResponse {
        let balance = ethers::utils::format_units(self.balance, decimals)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or_default();
        BalanceResponse {
            valid: self.valid,
            error: self.error.clone(),
            timestamp: self.timestamp,
            return_time: self.return_time,
            balance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub valid: bool,
    pub error: String,
    pub timestamp: u64,
    pub return_time: u64,
    pub balance: f64,
}

/// Point-in-time aggregate of balances and pending activities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthDataSnapshot {
    pub valid: bool,
    #[serde(default)]
    pub error: String,
    pub timestamp: u64,
    pub return_time: u64,
    pub exchange_balances: HashMap<ExchangeId, EBalanceEntry>,
    pub reserve_balances: HashMap<String, BalanceEntry>,
    pub pending_activities: Vec<ActivityRecord>,
    pub block: u64,
}

impl AuthDataSnapshot {
    pub fn new(timestamp: u64) -> Self {
        Self {
            valid: true,
            timestamp,
            ..Default::default()
        }
    }

    /// Mark invalid, keeping the latest error message
    pub fn invalidate(&mut self, error: impl Into<String>) {
        self.valid = false;
        self.error = error.into();
    }
}
