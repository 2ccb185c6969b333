//! Chain-side capabilities consumed by the fetcher

use std::collections::HashMap;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};

use crate::domain::{AllRateEntry, BalanceEntry};
use crate::error::Result;

/// What the node knows about a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxObservation {
    /// Known to the node, no receipt yet
    Pending,
    /// Receipt present, execution succeeded
    Mined,
    /// Receipt present, execution reverted
    Failed,
    /// Unknown to the node
    Lost,
}

impl TxObservation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "",
            Self::Mined => "mined",
            Self::Failed => "failed",
            Self::Lost => "lost",
        }
    }
}

#[async_trait]
pub trait Blockchain: Send + Sync {
    async fn current_block(&self) -> Result<u64>;

    /// Observation of `tx` and the block it was mined in (0 while unmined)
    async fn tx_status(&self, tx: H256) -> Result<(TxObservation, u64)>;

    /// Token balances of the reserve contract, keyed by token symbol.
    /// `block == 0` reads the latest state.
    async fn fetch_balance_data(
        &self,
        reserve: Address,
        block: u64,
    ) -> Result<HashMap<String, BalanceEntry>>;

    async fn fetch_rates(&self, from_block: u64, to_block: u64) -> Result<AllRateEntry>;

    /// Mined nonce of the account that signs set-rates transactions
    async fn set_rate_mined_nonce(&self) -> Result<u64>;
}
