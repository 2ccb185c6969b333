//! Activity status resolution
//!
//! Status and balances come from separate calls, so the far side can move in
//! between and the combined view would be inconsistent. [`double_check`]
//! reads statuses, then balances, then statuses again, and only accepts the
//! round when both status reads agree.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::Address;
use tracing::{debug, info, warn};

use crate::blockchain::{Blockchain, TxObservation};
use crate::domain::{
    decode_tx_hash, statuses_unchanged, Activity, ActivityRecord, ActivityStatus,
    BalanceEntry, EBalanceEntry, MiningStatus, StatusMap,
};
use crate::error::{ReserveError, Result};
use crate::exchange::Exchange;

pub const LOST_TX_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Retry policy of the double-check loop. The default never gives up.
#[derive(Debug, Clone, Default)]
pub struct DoubleCheckPolicy {
    pub max_rounds: Option<u32>,
    pub backoff: Duration,
}

/// A source whose statuses and balances must be read consistently
#[async_trait]
pub trait StatusSource: Send + Sync {
    type Balances: Send;

    fn source_name(&self) -> String;

    async fn read_statuses(&self) -> StatusMap;

    async fn read_balances(&self) -> Result<Self::Balances>;
}

#[derive(Debug)]
pub struct Consistent<B> {
    pub balances: B,
    pub statuses: StatusMap,
    pub rounds: u32,
}

/// Read balances bracketed by two status reads until the reads agree.
///
/// A balance read failure ends the loop with that error.
pub async fn double_check<S: StatusSource>(
    source: &S,
    policy: &DoubleCheckPolicy,
) -> Result<Consistent<S::Balances>> {
    let mut rounds = 0u32;
    loop {
        rounds += 1;
        let pre = source.read_statuses().await;
        let balances = source.read_balances().await?;
        let post = source.read_statuses().await;

        if statuses_unchanged(&pre, &post) {
            if rounds > 1 {
                info!(source = %source.source_name(), rounds, "statuses converged");
            }
            return Ok(Consistent {
                balances,
                statuses: post,
                rounds,
            });
        }

        warn!(
            source = %source.source_name(),
            rounds,
            "statuses changed while reading balances, retrying"
        );
        if policy.max_rounds.is_some_and(|max| rounds >= max) {
            return Err(ReserveError::Inconsistent {
                source_name: source.source_name(),
                rounds,
            });
        }
        if !policy.backoff.is_zero() {
            tokio::time::sleep(policy.backoff).await;
        }
    }
}

/// Exchange-side verdicts for the pending activities destined to `exchange`
pub async fn fetch_status_from_exchange(
    exchange: &dyn Exchange,
    pendings: &[ActivityRecord],
    timepoint: u64,
) -> StatusMap {
    let exchange_id = exchange.id();
    let mut result = StatusMap::new();

    for activity in pendings
        .iter()
        .filter(|a| a.is_exchange_pending() && a.destination == exchange_id.as_str())
    {
        let id = &activity.id;
        let recorded_tx = activity.activity.tx().unwrap_or_default().to_string();

        let (status, tx) = match &activity.activity {
            Activity::Trade { params, .. } => (
                exchange
                    .order_status(&id.eid, &params.base, &params.quote)
                    .await,
                String::new(),
            ),
            Activity::Deposit { params, .. } => {
                let status = exchange
                    .deposit_status(id, &recorded_tx, &params.token, params.amount, timepoint)
                    .await;
                debug!(activity = %id, ?status, "deposit status");
                (status, recorded_tx)
            }
            Activity::Withdraw { params, .. } => {
                match exchange
                    .withdraw_status(&id.eid, &params.token, params.amount, timepoint)
                    .await
                {
                    Ok((status, tx)) => {
                        debug!(activity = %id, ?status, %tx, "withdraw status");
                        let tx = if tx.is_empty() { recorded_tx } else { tx };
                        (Ok(status), tx)
                    }
                    Err(e) => (Err(e), recorded_tx),
                }
            }
            Activity::SetRates { .. } => continue,
        };

        let verdict = match status {
            Ok(exchange_status) => ActivityStatus {
                exchange_status,
                tx,
                block_number: 0,
                mining_status: activity.mining_status,
                error: None,
            },
            Err(e) => {
                warn!(exchange = %exchange_id, activity = %id, error = %e, "status lookup failed");
                ActivityStatus {
                    exchange_status: activity.exchange_status,
                    tx,
                    block_number: 0,
                    mining_status: activity.mining_status,
                    error: Some(e.to_string()),
                }
            }
        };
        result.insert(id.clone(), verdict);
    }
    result
}

/// Next mining status of a chain-pending activity, `None` when unchanged
pub fn next_mining_status(
    activity: &ActivityRecord,
    observation: TxObservation,
    mined_nonce: Option<u64>,
    now: u64,
    lost_timeout: Duration,
) -> Option<MiningStatus> {
    match observation {
        TxObservation::Mined => Some(MiningStatus::Mined),
        TxObservation::Failed => Some(MiningStatus::Failed),
        TxObservation::Lost => {
            let elapsed = now.saturating_sub(activity.timestamp);
            if elapsed > lost_timeout.as_millis() as u64 {
                info!(
                    activity = %activity.id,
                    tx = activity.activity.tx().unwrap_or_default(),
                    elapsed_ms = elapsed,
                    "tx lost past timeout, marking failed"
                );
                Some(MiningStatus::Failed)
            } else {
                None
            }
        }
        TxObservation::Pending => match (&activity.activity, mined_nonce) {
            // a later set-rates consumed this nonce, the tx can never be mined
            (Activity::SetRates { result, .. }, Some(mined)) => result
                .nonce
                .filter(|nonce| *nonce < mined)
                .map(|_| MiningStatus::Failed),
            _ => None,
        },
    }
}

/// Chain-side verdicts for pending on-chain activities
pub async fn fetch_status_from_blockchain(
    blockchain: &dyn Blockchain,
    pendings: &[ActivityRecord],
    now: u64,
    lost_timeout: Duration,
) -> StatusMap {
    let mined_nonce = match blockchain.set_rate_mined_nonce().await {
        Ok(nonce) => Some(nonce),
        Err(e) => {
            warn!(error = %e, "getting set-rates mined nonce failed");
            None
        }
    };

    let mut result = StatusMap::new();
    for activity in pendings.iter().filter(|a| a.is_blockchain_pending()) {
        let Some(tx) = activity.activity.tx() else {
            continue;
        };
        let Some(hash) = decode_tx_hash(tx) else {
            continue;
        };

        let (observation, block_number, error) = match blockchain.tx_status(hash).await {
            Ok((observation, block)) => (observation, block, None),
            Err(e) => {
                warn!(activity = %activity.id, %tx, error = %e, "tx status failed, treated as pending");
                (TxObservation::Pending, 0, Some(e.to_string()))
            }
        };

        let next = next_mining_status(activity, observation, mined_nonce, now, lost_timeout);
        if next.is_none() && error.is_none() {
            continue;
        }
        result.insert(
            activity.id.clone(),
            ActivityStatus {
                exchange_status: activity.exchange_status,
                tx: tx.to_string(),
                block_number,
                mining_status: next.unwrap_or(activity.mining_status),
                error,
            },
        );
    }
    result
}

/// One venue as a double-check source
pub struct ExchangeSource<'a> {
    pub exchange: &'a dyn Exchange,
    pub pendings: &'a [ActivityRecord],
    pub timepoint: u64,
}

#[async_trait]
impl StatusSource for ExchangeSource<'_> {
    type Balances = EBalanceEntry;

    fn source_name(&self) -> String {
        self.exchange.name()
    }

    async fn read_statuses(&self) -> StatusMap {
        fetch_status_from_exchange(self.exchange, self.pendings, self.timepoint).await
    }

    async fn read_balances(&self) -> Result<EBalanceEntry> {
        self.exchange.fetch_ebalance_data(self.timepoint).await
    }
}

/// The reserve contract as a double-check source
pub struct ChainSource<'a> {
    pub blockchain: &'a dyn Blockchain,
    pub pendings: &'a [ActivityRecord],
    pub reserve: Address,
    pub now: u64,
    pub lost_timeout: Duration,
}

#[async_trait]
impl StatusSource for ChainSource<'_> {
    type Balances = HashMap<String, BalanceEntry>;

    fn source_name(&self) -> String {
        "blockchain".to_string()
    }

    async fn read_statuses(&self) -> StatusMap {
        fetch_status_from_blockchain(self.blockchain, self.pendings, self.now, self.lost_timeout)
            .await
    }

    async fn read_balances(&self) -> Result<HashMap<String, BalanceEntry>> {
        self.blockchain.fetch_balance_data(self.reserve, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ActivityId, DepositParams, ExchangeId, ExchangeStatus, SetRatesParams, TxResult,
        WithdrawParams,
    };
    use ethers::types::{H256, U256};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const MINUTE: u64 = 60_000;

    fn status(exchange_status: ExchangeStatus) -> ActivityStatus {
        ActivityStatus {
            exchange_status,
            tx: String::new(),
            block_number: 0,
            mining_status: MiningStatus::Pending,
            error: None,
        }
    }

    /// Source whose status read flips `flips` times before settling
    struct FlappingSource {
        flips: u32,
        status_reads: AtomicU32,
        balance_reads: AtomicU32,
    }

    impl FlappingSource {
        fn new(flips: u32) -> Self {
            Self {
                flips,
                status_reads: AtomicU32::new(0),
                balance_reads: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StatusSource for FlappingSource {
        type Balances = u32;

        fn source_name(&self) -> String {
            "flapping".into()
        }

        async fn read_statuses(&self) -> StatusMap {
            tokio::task::yield_now().await;
            let read = self.status_reads.fetch_add(1, Ordering::SeqCst);
            // the first read of each unsettled round sees the old status
            let exchange_status = if read >= self.flips * 2 || read % 2 == 1 {
                ExchangeStatus::Done
            } else {
                ExchangeStatus::Pending
            };
            [(ActivityId::new("a", 1), status(exchange_status))].into()
        }

        async fn read_balances(&self) -> Result<u32> {
            Ok(self.balance_reads.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn stable_source_takes_one_round() {
        let source = FlappingSource::new(0);
        let consistent = double_check(&source, &DoubleCheckPolicy::default())
            .await
            .unwrap();
        assert_eq!(consistent.rounds, 1);
        assert_eq!(source.status_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn source_changing_once_takes_two_rounds() {
        let source = FlappingSource::new(1);
        let consistent = double_check(&source, &DoubleCheckPolicy::default())
            .await
            .unwrap();

        assert_eq!(consistent.rounds, 2);
        assert_eq!(source.balance_reads.load(Ordering::SeqCst), 2);
        assert_eq!(consistent.balances, 1);
        let settled = &consistent.statuses[&ActivityId::new("a", 1)];
        assert_eq!(settled.exchange_status, ExchangeStatus::Done);
    }

    #[tokio::test]
    async fn never_settling_source_keeps_retrying() {
        let source = FlappingSource::new(u32::MAX / 2);
        let outcome = tokio::time::timeout(
            Duration::from_millis(200),
            double_check(&source, &DoubleCheckPolicy::default()),
        )
        .await;

        assert!(outcome.is_err(), "unbounded loop must not return");
        assert!(source.balance_reads.load(Ordering::SeqCst) >= 10);
    }

    #[tokio::test]
    async fn capped_policy_reports_inconsistency() {
        let source = FlappingSource::new(u32::MAX / 2);
        let policy = DoubleCheckPolicy {
            max_rounds: Some(3),
            backoff: Duration::ZERO,
        };
        let err = double_check(&source, &policy).await.unwrap_err();
        assert!(matches!(err, ReserveError::Inconsistent { rounds: 3, .. }));
        assert_eq!(source.balance_reads.load(Ordering::SeqCst), 3);
    }

    fn deposit(created_at: u64) -> ActivityRecord {
        ActivityRecord::new(
            ActivityId::new("0x0a", created_at),
            "binance",
            Activity::Deposit {
                params: DepositParams {
                    exchange: "binance".into(),
                    token: "ETH".into(),
                    amount: dec!(1),
                },
                result: TxResult::with_tx("0x0a"),
            },
        )
    }

    fn set_rates(nonce: u64) -> ActivityRecord {
        ActivityRecord::new(
            ActivityId::new("0x0b", 0),
            "blockchain",
            Activity::SetRates {
                params: SetRatesParams {
                    tokens: vec!["KNC".into()],
                    buys: vec![U256::one()],
                    sells: vec![U256::one()],
                    block: 1,
                },
                result: TxResult {
                    nonce: Some(nonce),
                    ..TxResult::with_tx("0x0b")
                },
            },
        )
    }

    #[test]
    fn lost_tx_fails_strictly_after_fifteen_minutes() {
        let activity = deposit(0);
        let at = |t: u64| {
            next_mining_status(&activity, TxObservation::Lost, None, t, LOST_TX_TIMEOUT)
        };
        assert_eq!(at(14 * MINUTE + 59_000), None);
        assert_eq!(at(15 * MINUTE), None);
        assert_eq!(at(15 * MINUTE + 1_000), Some(MiningStatus::Failed));
    }

    #[test]
    fn receipts_decide_terminal_status() {
        let activity = deposit(0);
        let next =
            |o| next_mining_status(&activity, o, Some(100), 0, LOST_TX_TIMEOUT);
        assert_eq!(next(TxObservation::Mined), Some(MiningStatus::Mined));
        assert_eq!(next(TxObservation::Failed), Some(MiningStatus::Failed));
        assert_eq!(next(TxObservation::Pending), None);
    }

    #[test]
    fn set_rates_below_mined_nonce_is_failed() {
        let stale = set_rates(4);
        let current = set_rates(5);
        let next = |a: &ActivityRecord| {
            next_mining_status(a, TxObservation::Pending, Some(5), 0, LOST_TX_TIMEOUT)
        };
        assert_eq!(next(&stale), Some(MiningStatus::Failed));
        assert_eq!(next(&current), None);
        assert_eq!(
            next_mining_status(&stale, TxObservation::Pending, None, 0, LOST_TX_TIMEOUT),
            None
        );
    }

    struct FakeChain {
        observations: HashMap<H256, (TxObservation, u64)>,
        queried: Mutex<Vec<H256>>,
    }

    #[async_trait]
    impl Blockchain for FakeChain {
        async fn current_block(&self) -> Result<u64> {
            Ok(0)
        }

        async fn tx_status(&self, tx: H256) -> Result<(TxObservation, u64)> {
            self.queried.lock().unwrap().push(tx);
            self.observations
                .get(&tx)
                .copied()
                .ok_or_else(|| ReserveError::Node("no such tx".into()))
        }

        async fn fetch_balance_data(
            &self,
            _: Address,
            _: u64,
        ) -> Result<HashMap<String, BalanceEntry>> {
            Ok(HashMap::new())
        }

        async fn fetch_rates(&self, _: u64, _: u64) -> Result<crate::domain::AllRateEntry> {
            Ok(Default::default())
        }

        async fn set_rate_mined_nonce(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn chain_resolution_skips_trades_and_zero_hashes() {
        let mined = deposit(0);
        let mut no_tx = deposit(0);
        no_tx.id = ActivityId::new("w", 0);
        no_tx.activity = Activity::Withdraw {
            params: WithdrawParams {
                exchange: "binance".into(),
                token: "ETH".into(),
                amount: Decimal::ONE,
            },
            result: TxResult::default(),
        };
        let chain = FakeChain {
            observations: [(H256::from_low_u64_be(0x0a), (TxObservation::Mined, 77))].into(),
            queried: Mutex::new(Vec::new()),
        };

        let statuses =
            fetch_status_from_blockchain(&chain, &[mined.clone(), no_tx], 0, LOST_TX_TIMEOUT)
                .await;

        assert_eq!(chain.queried.lock().unwrap().len(), 1);
        let verdict = &statuses[&mined.id];
        assert_eq!(verdict.mining_status, MiningStatus::Mined);
        assert_eq!(verdict.block_number, 77);
        assert_eq!(verdict.tx, "0x0a");
    }

    #[tokio::test]
    async fn chain_lookup_error_keeps_status_and_reports_error() {
        let activity = deposit(0);
        let chain = FakeChain {
            observations: HashMap::new(),
            queried: Mutex::new(Vec::new()),
        };
        let statuses =
            fetch_status_from_blockchain(&chain, &[activity.clone()], 0, LOST_TX_TIMEOUT).await;
        let verdict = &statuses[&activity.id];
        assert_eq!(verdict.mining_status, MiningStatus::Pending);
        assert!(verdict.error.as_deref().unwrap().contains("no such tx"));
    }

    struct WithdrawVenue;

    #[async_trait]
    impl Exchange for WithdrawVenue {
        fn id(&self) -> ExchangeId {
            ExchangeId::new("binance")
        }

        async fn fetch_ebalance_data(&self, _: u64) -> Result<EBalanceEntry> {
            Ok(EBalanceEntry::default())
        }

        async fn order_status(&self, _: &str, _: &str, _: &str) -> Result<ExchangeStatus> {
            Err(ReserveError::exchange("binance", "order lookup down"))
        }

        async fn deposit_status(
            &self,
            _: &ActivityId,
            _: &str,
            _: &str,
            _: Decimal,
            _: u64,
        ) -> Result<ExchangeStatus> {
            Ok(ExchangeStatus::Pending)
        }

        async fn withdraw_status(
            &self,
            _: &str,
            _: &str,
            _: Decimal,
            _: u64,
        ) -> Result<(ExchangeStatus, String)> {
            Ok((ExchangeStatus::Done, "0xfeed".into()))
        }
    }

    #[tokio::test]
    async fn exchange_resolution_dispatches_by_action() {
        let withdraw = ActivityRecord::new(
            ActivityId::new("wd-9", 3),
            "binance",
            Activity::Withdraw {
                params: WithdrawParams {
                    exchange: "binance".into(),
                    token: "KNC".into(),
                    amount: dec!(50),
                },
                result: TxResult::default(),
            },
        );
        let trade = ActivityRecord::new(
            ActivityId::new("ord-1", 4),
            "binance",
            Activity::Trade {
                params: crate::domain::TradeParams {
                    exchange: "binance".into(),
                    side: crate::domain::TradeSide::Sell,
                    base: "KNC".into(),
                    quote: "ETH".into(),
                    rate: dec!(0.002),
                    amount: dec!(10),
                },
                result: Default::default(),
            },
        );
        let mut elsewhere = withdraw.clone();
        elsewhere.id = ActivityId::new("wd-10", 5);
        elsewhere.destination = "huobi".into();

        let statuses = fetch_status_from_exchange(
            &WithdrawVenue,
            &[withdraw.clone(), trade.clone(), elsewhere.clone()],
            10,
        )
        .await;

        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[&withdraw.id].exchange_status, ExchangeStatus::Done);
        assert_eq!(statuses[&withdraw.id].tx, "0xfeed");
        assert_eq!(statuses[&trade.id].exchange_status, ExchangeStatus::Pending);
        assert!(statuses[&trade.id].error.is_some());
        assert!(!statuses.contains_key(&elsewhere.id));
    }
}
