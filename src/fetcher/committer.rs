//! Folds one cycle's resolver output into a versioned auth snapshot

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::domain::{
    ActivityRecord, ActivityStatus, AuthDataSnapshot, BalanceEntry, EBalanceEntry, ExchangeId,
    StatusMap, Version,
};
use crate::error::Result;
use crate::storage::Storage;
use crate::time::now_ms;

/// Everything one auth-data cycle produced, joined across all tasks
#[derive(Debug)]
pub struct CycleResults {
    pub exchange_balances: HashMap<ExchangeId, EBalanceEntry>,
    /// `Err` carries the chain balance failure
    pub reserve_balances: std::result::Result<HashMap<String, BalanceEntry>, String>,
    pub exchange_statuses: StatusMap,
    pub chain_statuses: StatusMap,
}

impl Default for CycleResults {
    fn default() -> Self {
        Self {
            exchange_balances: HashMap::new(),
            reserve_balances: Ok(HashMap::new()),
            exchange_statuses: StatusMap::new(),
            chain_statuses: StatusMap::new(),
        }
    }
}

pub struct SnapshotCommitter {
    storage: Arc<dyn Storage>,
}

impl SnapshotCommitter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Latest committed snapshot, looked up at most once per commit
    async fn previous_snapshot(&self) -> std::result::Result<AuthDataSnapshot, String> {
        let version = self
            .storage
            .current_auth_data_version(now_ms())
            .await
            .map_err(|e| e.to_string())?;
        self.storage
            .get_auth_data(version)
            .await
            .map_err(|e| e.to_string())
    }

    /// Commit `snapshot` built from `results`, persisting every pending
    /// activity on the way. Returns the new snapshot version.
    pub async fn commit(
        &self,
        mut snapshot: AuthDataSnapshot,
        results: CycleResults,
        pendings: Vec<ActivityRecord>,
        timepoint: u64,
    ) -> Result<Version> {
        let CycleResults {
            exchange_balances,
            reserve_balances,
            exchange_statuses,
            chain_statuses,
        } = results;

        let needs_previous = exchange_balances.values().any(|b| !b.valid)
            || reserve_balances.is_err();
        let previous = if needs_previous {
            Some(self.previous_snapshot().await)
        } else {
            None
        };

        let merged = merge_exchange_balances(&mut snapshot, exchange_balances, previous.as_ref());
        snapshot.exchange_balances = merged;
        snapshot.reserve_balances = match reserve_balances {
            Ok(balances) => balances,
            Err(e) => {
                snapshot.invalidate(e);
                match previous.as_ref() {
                    Some(Ok(prev)) => {
                        debug!("carrying reserve balances forward");
                        prev.reserve_balances.clone()
                    }
                    _ => HashMap::new(),
                }
            }
        };

        let mut still_pending = Vec::new();
        for mut activity in pendings {
            let id = activity.id.clone();
            let errors = apply_statuses(
                &mut activity,
                exchange_statuses.get(&id),
                chain_statuses.get(&id),
            );
            if let Some(e) = errors {
                snapshot.invalidate(e);
            }

            if let Err(e) = self.storage.update_activity(&activity.id, &activity).await {
                error!(activity = %activity.id, error = %e, "persisting activity failed");
                snapshot.invalidate(e.to_string());
            }
            if activity.is_pending() {
                still_pending.push(activity);
            } else {
                info!(
                    activity = %activity.id,
                    exchange_status = activity.exchange_status.as_str(),
                    mining_status = activity.mining_status.as_str(),
                    "activity settled"
                );
            }
        }
        snapshot.pending_activities = still_pending;

        let version = self.storage.store_auth_snapshot(&snapshot, timepoint).await?;
        info!(
            version,
            valid = snapshot.valid,
            pending = snapshot.pending_activities.len(),
            "auth snapshot committed"
        );
        Ok(version)
    }
}

fn merge_exchange_balances(
    snapshot: &mut AuthDataSnapshot,
    balances: HashMap<ExchangeId, EBalanceEntry>,
    previous: Option<&std::result::Result<AuthDataSnapshot, String>>,
) -> HashMap<ExchangeId, EBalanceEntry> {
    let mut merged = HashMap::with_capacity(balances.len());
    for (exchange, entry) in balances {
        if entry.valid {
            merged.insert(exchange, entry);
            continue;
        }
        warn!(%exchange, error = %entry.error, "balance fetch failed this cycle");
        snapshot.invalidate(entry.error.clone());
        let kept = match previous {
            Some(Ok(prev)) => match prev.exchange_balances.get(&exchange) {
                Some(last_known) => EBalanceEntry::carried_forward(last_known, &entry),
                None => entry,
            },
            Some(Err(lookup)) => {
                debug!(%exchange, error = %lookup, "no previous snapshot to carry balances from");
                entry
            }
            None => entry,
        };
        merged.insert(exchange, kept);
    }
    merged
}

/// Apply this cycle's verdicts to `activity`; returns the joined error text
/// when any resolver reported one.
///
/// Pending flags are read before any field changes, so both sides are
/// judged against the state the cycle started from.
fn apply_statuses(
    activity: &mut ActivityRecord,
    from_exchange: Option<&ActivityStatus>,
    from_chain: Option<&ActivityStatus>,
) -> Option<String> {
    let was_exchange_pending = activity.is_exchange_pending();
    let was_chain_pending = activity.is_blockchain_pending();
    let mut errors = Vec::new();

    if let Some(status) = from_exchange {
        if was_exchange_pending {
            activity.exchange_status = status.exchange_status;
        }
        activity.activity.backfill_tx(&status.tx);
        errors.extend(status.error.clone());
    }
    if let Some(status) = from_chain {
        if was_chain_pending {
            activity.mining_status = status.mining_status;
        }
        activity.activity.backfill_tx(&status.tx);
        activity.activity.meta_mut().block_number = status.block_number;
        errors.extend(status.error.clone());
    }

    if from_exchange.is_none() && from_chain.is_none() {
        return None;
    }
    let joined = errors.join("; ");
    activity.activity.meta_mut().status_error = joined.clone();
    (!joined.is_empty()).then_some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Activity, ActivityId, ExchangeStatus, MiningStatus, TxResult, WithdrawParams,
    };
    use crate::storage::MemoryStorage;
    use ethers::types::U256;
    use rust_decimal_macros::dec;

    fn balances(eth: rust_decimal::Decimal) -> EBalanceEntry {
        EBalanceEntry {
            valid: true,
            timestamp: 1,
            return_time: 2,
            available_balance: [("ETH".to_string(), eth)].into(),
            status: true,
            ..Default::default()
        }
    }

    fn withdraw(eid: &str) -> ActivityRecord {
        ActivityRecord::new(
            ActivityId::new(eid, 1),
            "binance",
            Activity::Withdraw {
                params: WithdrawParams {
                    exchange: "binance".into(),
                    token: "ETH".into(),
                    amount: dec!(1),
                },
                result: TxResult::default(),
            },
        )
    }

    fn verdict(exchange_status: ExchangeStatus, tx: &str, error: Option<&str>) -> ActivityStatus {
        ActivityStatus {
            exchange_status,
            tx: tx.into(),
            block_number: 0,
            mining_status: MiningStatus::Pending,
            error: error.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn failed_venue_keeps_last_known_balances() {
        let store = Arc::new(MemoryStorage::new());
        let committer = SnapshotCommitter::new(store.clone());
        let binance = ExchangeId::new("binance");

        let first = CycleResults {
            exchange_balances: [(binance.clone(), balances(dec!(7)))].into(),
            ..Default::default()
        };
        committer
            .commit(AuthDataSnapshot::new(1), first, Vec::new(), 1)
            .await
            .unwrap();

        let second = CycleResults {
            exchange_balances: [(binance.clone(), EBalanceEntry::failed("503", 5))].into(),
            ..Default::default()
        };
        let version = committer
            .commit(AuthDataSnapshot::new(5), second, Vec::new(), 5)
            .await
            .unwrap();

        let snapshot = store.get_auth_data(version).await.unwrap();
        assert!(!snapshot.valid);
        assert_eq!(snapshot.error, "503");
        let entry = &snapshot.exchange_balances[&binance];
        assert_eq!(entry.available_balance["ETH"], dec!(7));
        assert!(!entry.valid);
        assert!(!entry.status);
    }

    #[tokio::test]
    async fn first_failure_without_history_keeps_failure_entry() {
        let store = Arc::new(MemoryStorage::new());
        let committer = SnapshotCommitter::new(store.clone());
        let huobi = ExchangeId::new("huobi");
        let results = CycleResults {
            exchange_balances: [(huobi.clone(), EBalanceEntry::failed("timeout", 3))].into(),
            ..Default::default()
        };

        let version = committer
            .commit(AuthDataSnapshot::new(3), results, Vec::new(), 3)
            .await
            .unwrap();
        let snapshot = store.get_auth_data(version).await.unwrap();
        assert!(!snapshot.valid);
        assert_eq!(snapshot.exchange_balances[&huobi].error, "timeout");
        assert!(snapshot.exchange_balances[&huobi].available_balance.is_empty());
    }

    #[tokio::test]
    async fn failed_reserve_balances_are_carried_forward() {
        let store = Arc::new(MemoryStorage::new());
        let committer = SnapshotCommitter::new(store.clone());
        let knc = BalanceEntry {
            valid: true,
            balance: U256::from(900u64),
            ..Default::default()
        };
        let first = CycleResults {
            reserve_balances: Ok([("KNC".to_string(), knc.clone())].into()),
            ..Default::default()
        };
        committer
            .commit(AuthDataSnapshot::new(1), first, Vec::new(), 1)
            .await
            .unwrap();

        let second = CycleResults {
            reserve_balances: Err("node down".into()),
            ..Default::default()
        };
        let version = committer
            .commit(AuthDataSnapshot::new(2), second, Vec::new(), 2)
            .await
            .unwrap();
        let snapshot = store.get_auth_data(version).await.unwrap();
        assert!(!snapshot.valid);
        assert_eq!(snapshot.error, "node down");
        assert_eq!(snapshot.reserve_balances["KNC"], knc);
    }

    #[tokio::test]
    async fn resolver_errors_are_recorded_per_activity() {
        let store = Arc::new(MemoryStorage::new());
        let committer = SnapshotCommitter::new(store.clone());
        let flaky = withdraw("w-1");
        let settled = withdraw("w-2");
        store.record_activity(flaky.clone()).await.unwrap();
        store.record_activity(settled.clone()).await.unwrap();

        let results = CycleResults {
            exchange_statuses: [
                (
                    flaky.id.clone(),
                    verdict(ExchangeStatus::Pending, "", Some("rate limited")),
                ),
                (settled.id.clone(), verdict(ExchangeStatus::Done, "0xaa", None)),
            ]
            .into(),
            chain_statuses: [(
                settled.id.clone(),
                ActivityStatus {
                    mining_status: MiningStatus::Mined,
                    block_number: 12,
                    ..verdict(ExchangeStatus::Done, "0xaa", None)
                },
            )]
            .into(),
            ..Default::default()
        };
        let version = committer
            .commit(
                AuthDataSnapshot::new(9),
                results,
                vec![flaky.clone(), settled.clone()],
                9,
            )
            .await
            .unwrap();

        let snapshot = store.get_auth_data(version).await.unwrap();
        assert!(!snapshot.valid);
        assert_eq!(snapshot.pending_activities.len(), 1);
        assert_eq!(snapshot.pending_activities[0].id, flaky.id);

        let stored_flaky = store.get_activity(&flaky.id).await.unwrap();
        assert_eq!(stored_flaky.activity.meta().status_error, "rate limited");

        let stored_settled = store.get_activity(&settled.id).await.unwrap();
        assert_eq!(stored_settled.exchange_status, ExchangeStatus::Done);
        assert_eq!(stored_settled.mining_status, MiningStatus::Mined);
        assert_eq!(stored_settled.activity.tx(), Some("0xaa"));
        assert_eq!(stored_settled.activity.meta().block_number, 12);
        assert_eq!(stored_settled.activity.meta().status_error, "");
    }

    #[tokio::test]
    async fn failed_activity_write_invalidates_snapshot() {
        let store = Arc::new(MemoryStorage::new());
        let committer = SnapshotCommitter::new(store.clone());
        let unknown = withdraw("never-recorded");

        let version = committer
            .commit(AuthDataSnapshot::new(4), CycleResults::default(), vec![unknown], 4)
            .await
            .unwrap();
        let snapshot = store.get_auth_data(version).await.unwrap();
        assert!(!snapshot.valid);
        assert!(snapshot.error.contains("never-recorded"));
        assert_eq!(snapshot.pending_activities.len(), 1);
    }
}
