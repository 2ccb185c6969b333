//! Storage collaborator contract
//!
//! Every `store_*` call commits a new version; versions are strictly
//! increasing per record kind and never rewritten, so any past version stays
//! readable.

mod memory;

pub use memory::{MemoryStorage, DEFAULT_MAX_VERSIONS};

use async_trait::async_trait;

use crate::domain::{
    ActivityId, ActivityRecord, AllPriceEntry, AllRateEntry, AllTradeHistory, AuthDataSnapshot,
    ExchangesStatus, OnePrice, TokenPairId, Version,
};
use crate::error::Result;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn store_price(&self, data: AllPriceEntry, timepoint: u64) -> Result<Version>;

    async fn store_rate(&self, data: AllRateEntry, timepoint: u64) -> Result<Version>;

    async fn store_auth_snapshot(&self, data: &AuthDataSnapshot, timepoint: u64)
        -> Result<Version>;

    async fn store_trade_history(&self, data: AllTradeHistory, timepoint: u64) -> Result<Version>;

    /// Insert a newly submitted activity
    async fn record_activity(&self, record: ActivityRecord) -> Result<()>;

    async fn get_pending_activities(&self) -> Result<Vec<ActivityRecord>>;

    async fn update_activity(&self, id: &ActivityId, record: &ActivityRecord) -> Result<()>;

    /// Activities created within `[from, to]`
    async fn get_all_records(&self, from: u64, to: u64) -> Result<Vec<ActivityRecord>>;

    async fn get_exchange_status(&self) -> Result<ExchangesStatus>;

    async fn update_exchange_status(&self, data: ExchangesStatus) -> Result<()>;

    /// Latest auth snapshot version committed at or before `timepoint`
    async fn current_auth_data_version(&self, timepoint: u64) -> Result<Version>;

    async fn get_auth_data(&self, version: Version) -> Result<AuthDataSnapshot>;

    async fn current_price_version(&self, timepoint: u64) -> Result<Version>;

    async fn get_all_prices(&self, version: Version) -> Result<AllPriceEntry>;

    async fn get_one_price(&self, pair: &TokenPairId, version: Version) -> Result<OnePrice>;

    async fn current_rate_version(&self, timepoint: u64) -> Result<Version>;

    async fn get_rate(&self, version: Version) -> Result<AllRateEntry>;

    /// Rate sets stored within `[from, to]`, oldest first
    async fn get_rates(&self, from: u64, to: u64) -> Result<Vec<AllRateEntry>>;

    /// Latest trade history stored at or before `timepoint`
    async fn get_trade_history(&self, timepoint: u64) -> Result<AllTradeHistory>;
}
