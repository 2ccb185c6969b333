//! Read accessors over committed state, for the query layer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{
    rates_duplicated, ActivityRecord, AllPriceResponse, AllRateEntry, AllRateResponse,
    AllTradeHistory, BalanceResponse, EBalanceEntry, ExStatus, ExchangeId, ExchangesStatus,
    OnePriceResponse, RateResponse, TokenPairId, Version,
};
use crate::error::Result;
use crate::storage::Storage;
use crate::time::now_ms;

const DEFAULT_DECIMALS: u32 = 18;

/// Auth snapshot with reserve balances scaled to token units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthDataRecord {
    pub valid: bool,
    pub error: String,
    pub timestamp: u64,
    pub return_time: u64,
    pub exchange_balances: HashMap<ExchangeId, EBalanceEntry>,
    pub reserve_balances: HashMap<String, BalanceResponse>,
    pub pending_activities: Vec<ActivityRecord>,
    pub block: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthDataResponse {
    pub version: Version,
    pub timestamp: u64,
    pub return_time: u64,
    pub data: AuthDataRecord,
}

fn rate_data(rate: &AllRateEntry) -> HashMap<String, RateResponse> {
    rate.data
        .iter()
        .map(|(token, entry)| (token.clone(), RateResponse::from_entry(rate, entry)))
        .collect()
}

#[derive(Clone)]
pub struct ReserveData {
    storage: Arc<dyn Storage>,
    /// Token symbol to decimals; unknown tokens use 18
    decimals: HashMap<String, u32>,
}

impl ReserveData {
    pub fn new(storage: Arc<dyn Storage>, decimals: HashMap<String, u32>) -> Self {
        Self { storage, decimals }
    }

    fn decimals_of(&self, token: &str) -> u32 {
        self.decimals.get(token).copied().unwrap_or(DEFAULT_DECIMALS)
    }

    pub async fn current_auth_data_version(&self, timepoint: u64) -> Result<Version> {
        self.storage.current_auth_data_version(timepoint).await
    }

    pub async fn get_auth_data(&self, timepoint: u64) -> Result<AuthDataResponse> {
        let timestamp = now_ms();
        let version = self.storage.current_auth_data_version(timepoint).await?;
        let snapshot = self.storage.get_auth_data(version).await?;

        let reserve_balances = snapshot
            .reserve_balances
            .iter()
            .map(|(token, balance)| {
                (
                    token.clone(),
                    balance.to_balance_response(self.decimals_of(token)),
                )
            })
            .collect();

        Ok(AuthDataResponse {
            version,
            timestamp,
            return_time: now_ms(),
            data: AuthDataRecord {
                valid: snapshot.valid,
                error: snapshot.error,
                timestamp: snapshot.timestamp,
                return_time: snapshot.return_time,
                exchange_balances: snapshot.exchange_balances,
                reserve_balances,
                pending_activities: snapshot.pending_activities,
                block: snapshot.block,
            },
        })
    }

    pub async fn current_price_version(&self, timepoint: u64) -> Result<Version> {
        self.storage.current_price_version(timepoint).await
    }

    pub async fn get_all_prices(&self, timepoint: u64) -> Result<AllPriceResponse> {
        let timestamp = now_ms();
        let version = self.storage.current_price_version(timepoint).await?;
        let prices = self.storage.get_all_prices(version).await?;
        Ok(AllPriceResponse {
            version,
            timestamp,
            return_time: now_ms(),
            data: prices.data,
            block: prices.block,
        })
    }

    pub async fn get_one_price(
        &self,
        pair: &TokenPairId,
        timepoint: u64,
    ) -> Result<OnePriceResponse> {
        let timestamp = now_ms();
        let version = self.storage.current_price_version(timepoint).await?;
        let data = self.storage.get_one_price(pair, version).await?;
        Ok(OnePriceResponse {
            version,
            timestamp,
            return_time: now_ms(),
            data,
        })
    }

    pub async fn current_rate_version(&self, timepoint: u64) -> Result<Version> {
        self.storage.current_rate_version(timepoint).await
    }

    pub async fn get_rate(&self, timepoint: u64) -> Result<AllRateResponse> {
        let timestamp = now_ms();
        let version = self.storage.current_rate_version(timepoint).await?;
        let rate = self.storage.get_rate(version).await?;
        Ok(AllRateResponse {
            version,
            valid: rate.valid,
            error: rate.error.clone(),
            timestamp,
            return_time: now_ms(),
            data: rate_data(&rate),
            block_number: rate.block_number,
            to_block_number: rate.block_number,
        })
    }

    /// Rate sets stored within `[from, to]`. Consecutive identical sets are
    /// merged into one response whose block span covers all of them.
    pub async fn get_rates(&self, from: u64, to: u64) -> Result<Vec<AllRateResponse>> {
        let rates = self.storage.get_rates(from, to).await?;
        let mut result: Vec<AllRateResponse> = Vec::new();

        for rate in rates {
            let one = AllRateResponse {
                version: 0,
                valid: rate.valid,
                error: rate.error.clone(),
                timestamp: rate.timestamp,
                return_time: rate.return_time,
                data: rate_data(&rate),
                block_number: rate.block_number,
                to_block_number: rate.block_number,
            };
            let duplicated = result
                .last()
                .is_some_and(|current| rates_duplicated(&one.data, &current.data));
            if !duplicated {
                result.push(one);
            } else if let Some(current) = result.last_mut() {
                current.to_block_number = one.block_number;
            }
        }
        Ok(result)
    }

    pub async fn get_records(&self, from: u64, to: u64) -> Result<Vec<ActivityRecord>> {
        self.storage.get_all_records(from, to).await
    }

    pub async fn get_pending_activities(&self) -> Result<Vec<ActivityRecord>> {
        self.storage.get_pending_activities().await
    }

    pub async fn get_trade_history(&self, timepoint: u64) -> Result<AllTradeHistory> {
        self.storage.get_trade_history(timepoint).await
    }

    pub async fn get_exchange_status(&self) -> Result<ExchangesStatus> {
        self.storage.get_exchange_status().await
    }

    pub async fn update_exchange_status(
        &self,
        exchange: &str,
        status: bool,
        timestamp: u64,
    ) -> Result<()> {
        let mut statuses = self.storage.get_exchange_status().await?;
        statuses.insert(exchange.to_string(), ExStatus { timestamp, status });
        self.storage.update_exchange_status(statuses).await
    }
}
