use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::domain::{
    ActivityId, EBalanceEntry, ExchangeId, ExchangePrice, ExchangeStatus, ExchangeTradeHistory,
    TokenPairId,
};
use crate::error::{ReserveError, Result};

fn unsupported(feature: &str, exchange: &ExchangeId) -> ReserveError {
    ReserveError::exchange(
        exchange.as_str(),
        format!("{} is not implemented", feature),
    )
}

/// Capabilities of one centralized venue.
///
/// Implementations own their transport and credentials; every call is
/// expected to be bounded by its own request timeout.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn id(&self) -> ExchangeId;

    fn name(&self) -> String {
        self.id().to_string()
    }

    async fn fetch_ebalance_data(&self, timepoint: u64) -> Result<EBalanceEntry>;

    async fn order_status(&self, order_id: &str, base: &str, quote: &str)
        -> Result<ExchangeStatus>;

    async fn deposit_status(
        &self,
        id: &ActivityId,
        tx: &str,
        currency: &str,
        amount: Decimal,
        timepoint: u64,
    ) -> Result<ExchangeStatus>;

    /// Status of a withdrawal plus the transaction hash once the venue has
    /// broadcast it (empty until then)
    async fn withdraw_status(
        &self,
        id: &str,
        currency: &str,
        amount: Decimal,
        timepoint: u64,
    ) -> Result<(ExchangeStatus, String)>;

    async fn fetch_price_data(
        &self,
        _timepoint: u64,
    ) -> Result<HashMap<TokenPairId, ExchangePrice>> {
        Err(unsupported("fetch_price_data", &self.id()))
    }

    async fn fetch_trade_history(&self, _timepoint: u64) -> Result<ExchangeTradeHistory> {
        Err(unsupported("fetch_trade_history", &self.id()))
    }
}
