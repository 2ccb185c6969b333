use std::collections::HashMap;

use ethers::types::{H256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Composite activity identifier: venue-local id plus the internal timepoint
/// the activity was created at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityId {
    /// Venue-local id (order id, withdrawal id, tx hash for on-chain actions)
    pub eid: String,
    pub timepoint: u64,
}

impl ActivityId {
    pub fn new(eid: impl Into<String>, timepoint: u64) -> Self {
        Self {
            eid: eid.into(),
            timepoint,
        }
    }
}

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.eid, self.timepoint)
    }
}

/// Action kind of an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Trade,
    Deposit,
    Withdraw,
    SetRates,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
            Self::SetRates => "set_rates",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exchange-side status of an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExchangeStatus {
    #[default]
    #[serde(rename = "", alias = "submitted", alias = "pending")]
    Pending,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "failed")]
    Failed,
}

impl ExchangeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Chain-side mining status of an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MiningStatus {
    #[default]
    #[serde(rename = "", alias = "submitted")]
    Pending,
    #[serde(rename = "mined")]
    Mined,
    #[serde(rename = "failed")]
    Failed,
}

impl MiningStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "",
            Self::Mined => "mined",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeParams {
    pub exchange: String,
    pub side: TradeSide,
    pub base: String,
    pub quote: String,
    pub rate: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositParams {
    pub exchange: String,
    pub token: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawParams {
    pub exchange: String,
    pub token: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetRatesParams {
    pub tokens: Vec<String>,
    pub buys: Vec<U256>,
    pub sells: Vec<U256>,
    pub block: u64,
}

/// Bookkeeping written by the snapshot committer on every resolution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionMeta {
    #[serde(default)]
    pub status_error: String,
    #[serde(default, rename = "blockNumber")]
    pub block_number: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    #[serde(default)]
    pub done: Decimal,
    #[serde(default)]
    pub remaining: Decimal,
    #[serde(default)]
    pub finished: bool,
    #[serde(flatten)]
    pub meta: ResolutionMeta,
}

/// Result payload of any action that goes through a transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxResult {
    /// Hex transaction hash; empty until known (withdrawals learn it from the venue)
    #[serde(default)]
    pub tx: String,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(flatten)]
    pub meta: ResolutionMeta,
}

impl TxResult {
    pub fn with_tx(tx: impl Into<String>) -> Self {
        Self {
            tx: tx.into(),
            ..Default::default()
        }
    }
}

/// One submitted operation with its typed parameters and results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Activity {
    Trade {
        params: TradeParams,
        result: TradeResult,
    },
    Deposit {
        params: DepositParams,
        result: TxResult,
    },
    Withdraw {
        params: WithdrawParams,
        result: TxResult,
    },
    SetRates {
        params: SetRatesParams,
        result: TxResult,
    },
}

impl Activity {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Trade { .. } => ActionKind::Trade,
            Self::Deposit { .. } => ActionKind::Deposit,
            Self::Withdraw { .. } => ActionKind::Withdraw,
            Self::SetRates { .. } => ActionKind::SetRates,
        }
    }

    pub fn tx_result(&self) -> Option<&TxResult> {
        match self {
            Self::Trade { .. } => None,
            Self::Deposit { result, .. }
            | Self::Withdraw { result, .. }
            | Self::SetRates { result, .. } => Some(result),
        }
    }

    fn tx_result_mut(&mut self) -> Option<&mut TxResult> {
        match self {
            Self::Trade { .. } => None,
            Self::Deposit { result, .. }
            | Self::Withdraw { result, .. }
            | Self::SetRates { result, .. } => Some(result),
        }
    }

    /// Recorded transaction hash, `None` for trades
    pub fn tx(&self) -> Option<&str> {
        self.tx_result().map(|r| r.tx.as_str())
    }

    /// Fill in the transaction hash if none was recorded yet.
    ///
    /// Returns true when the hash was back-filled.
    pub fn backfill_tx(&mut self, tx: &str) -> bool {
        match self.tx_result_mut() {
            Some(result) if result.tx.is_empty() && !tx.is_empty() => {
                result.tx = tx.to_string();
                true
            }
            _ => false,
        }
    }

    pub fn meta(&self) -> &ResolutionMeta {
        match self {
            Self::Trade { result, .. } => &result.meta,
            Self::Deposit { result, .. }
            | Self::Withdraw { result, .. }
            | Self::SetRates { result, .. } => &result.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ResolutionMeta {
        match self {
            Self::Trade { result, .. } => &mut result.meta,
            Self::Deposit { result, .. }
            | Self::Withdraw { result, .. }
            | Self::SetRates { result, .. } => &mut result.meta,
        }
    }
}

/// A tracked activity as persisted by storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: ActivityId,
    /// Venue id for exchange-side actions, "blockchain" for set-rates
    pub destination: String,
    #[serde(flatten)]
    pub activity: Activity,
    #[serde(default)]
    pub exchange_status: ExchangeStatus,
    #[serde(default)]
    pub mining_status: MiningStatus,
    /// Creation time in milliseconds
    pub timestamp: u64,
}

impl ActivityRecord {
    pub fn new(id: ActivityId, destination: impl Into<String>, activity: Activity) -> Self {
        let timestamp = id.timepoint;
        Self {
            id,
            destination: destination.into(),
            activity,
            exchange_status: ExchangeStatus::Pending,
            mining_status: MiningStatus::Pending,
            timestamp,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.activity.kind()
    }

    pub fn is_exchange_pending(&self) -> bool {
        match self.kind() {
            ActionKind::Trade => !self.exchange_status.is_terminal(),
            ActionKind::Deposit | ActionKind::Withdraw => {
                !self.exchange_status.is_terminal() && self.mining_status != MiningStatus::Failed
            }
            ActionKind::SetRates => false,
        }
    }

    pub fn is_blockchain_pending(&self) -> bool {
        match self.kind() {
            ActionKind::Deposit | ActionKind::Withdraw | ActionKind::SetRates => {
                !self.mining_status.is_terminal() && self.exchange_status != ExchangeStatus::Failed
            }
            ActionKind::Trade => false,
        }
    }

    /// Pending while either side can still change
    pub fn is_pending(&self) -> bool {
        self.is_exchange_pending() || self.is_blockchain_pending()
    }
}

/// A resolver's per-cycle verdict for one activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityStatus {
    pub exchange_status: ExchangeStatus,
    pub tx: String,
    pub block_number: u64,
    pub mining_status: MiningStatus,
    pub error: Option<String>,
}

impl ActivityStatus {
    /// Fields the double-check protocol compares between two reads
    pub fn same_outcome(&self, other: &ActivityStatus) -> bool {
        self.exchange_status == other.exchange_status
            && self.mining_status == other.mining_status
            && self.tx == other.tx
    }
}

pub type StatusMap = HashMap<ActivityId, ActivityStatus>;

/// True when both reads carry the same ids with the same outcome
pub fn statuses_unchanged(pre: &StatusMap, post: &StatusMap) -> bool {
    pre.len() == post.len()
        && pre
            .iter()
            .all(|(id, status)| post.get(id).is_some_and(|p| status.same_outcome(p)))
}

/// Decode a recorded hex hash. Empty, malformed and zero hashes yield `None`.
pub fn decode_tx_hash(tx: &str) -> Option<H256> {
    let hex = tx.trim().trim_start_matches("0x");
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let padded = if hex.len() >= 64 {
        hex[hex.len() - 64..].to_string()
    } else {
        format!("{:0>64}", hex)
    };
    let bytes = ethers::utils::hex::decode(padded).ok()?;
    let hash = H256::from_slice(&bytes);
    (!hash.is_zero()).then_some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn withdraw(tx: &str) -> ActivityRecord {
        ActivityRecord::new(
            ActivityId::new("w-1", 1_000),
            "binance",
            Activity::Withdraw {
                params: WithdrawParams {
                    exchange: "binance".into(),
                    token: "KNC".into(),
                    amount: dec!(12.5),
                },
                result: TxResult::with_tx(tx),
            },
        )
    }

    #[test]
    fn withdraw_pending_until_both_sides_terminal() {
        let mut record = withdraw("");
        assert!(record.is_exchange_pending());
        assert!(record.is_blockchain_pending());

        record.exchange_status = ExchangeStatus::Done;
        assert!(record.is_pending());

        record.mining_status = MiningStatus::Mined;
        assert!(!record.is_pending());
    }

    #[test]
    fn failed_mining_ends_exchange_side_of_deposit() {
        let mut record = withdraw("0xabc");
        record.mining_status = MiningStatus::Failed;
        assert!(!record.is_exchange_pending());
        assert!(!record.is_pending());
    }

    #[test]
    fn set_rates_is_chain_only() {
        let record = ActivityRecord::new(
            ActivityId::new("0x01", 5),
            "blockchain",
            Activity::SetRates {
                params: SetRatesParams {
                    tokens: vec!["KNC".into()],
                    buys: vec![U256::from(1)],
                    sells: vec![U256::from(2)],
                    block: 10,
                },
                result: TxResult::with_tx("0x01"),
            },
        );
        assert!(!record.is_exchange_pending());
        assert!(record.is_blockchain_pending());
    }

    #[test]
    fn backfill_only_replaces_empty_tx() {
        let mut record = withdraw("");
        assert!(record.activity.backfill_tx("0xfeed"));
        assert_eq!(record.activity.tx(), Some("0xfeed"));
        assert!(!record.activity.backfill_tx("0xbeef"));
        assert_eq!(record.activity.tx(), Some("0xfeed"));
    }

    #[test]
    fn record_serializes_with_action_tag_and_legacy_status_strings() {
        let record = withdraw("0xabc");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["action"], "withdraw");
        assert_eq!(json["result"]["tx"], "0xabc");
        assert_eq!(json["mining_status"], "");

        let mut legacy = json.clone();
        legacy["exchange_status"] = "submitted".into();
        let parsed: ActivityRecord = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.exchange_status, ExchangeStatus::Pending);
    }

    #[test]
    fn zero_and_empty_hashes_are_not_decoded() {
        assert!(decode_tx_hash("").is_none());
        assert!(decode_tx_hash("0x").is_none());
        assert!(decode_tx_hash(&format!("0x{}", "0".repeat(64))).is_none());
        assert!(decode_tx_hash("0xzz").is_none());
        assert_eq!(decode_tx_hash("0x1"), Some(H256::from_low_u64_be(1)));
    }

    #[test]
    fn non_ascii_hashes_are_rejected_without_slicing() {
        assert!(decode_tx_hash(&format!("{}a", "é".repeat(40))).is_none());
        assert!(decode_tx_hash(&format!("0x{}ü", "ab".repeat(32))).is_none());
        let long = format!("0xff{}", "0".repeat(63) + "2");
        assert_eq!(decode_tx_hash(&long), Some(H256::from_low_u64_be(2)));
    }

    #[test]
    fn unchanged_compares_outcome_fields_only() {
        let id = ActivityId::new("a", 1);
        let status = ActivityStatus {
            exchange_status: ExchangeStatus::Pending,
            tx: "0x1".into(),
            block_number: 10,
            mining_status: MiningStatus::Pending,
            error: None,
        };
        let pre: StatusMap = [(id.clone(), status.clone())].into();

        let mut later = status.clone();
        later.block_number = 11;
        later.error = Some("flaky".into());
        assert!(statuses_unchanged(&pre, &[(id.clone(), later)].into()));

        let mut moved = status;
        moved.exchange_status = ExchangeStatus::Done;
        assert!(!statuses_unchanged(&pre, &[(id, moved)].into()));
        assert!(!statuses_unchanged(&pre, &StatusMap::new()));
    }
}
