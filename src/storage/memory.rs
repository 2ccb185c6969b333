use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::Storage;
use crate::domain::{
    ActivityId, ActivityRecord, AllPriceEntry, AllRateEntry, AllTradeHistory, AuthDataSnapshot,
    ExchangesStatus, OnePrice, TokenPairId, Version,
};
use crate::error::{ReserveError, Result};

/// Versions kept per record kind unless configured otherwise
pub const DEFAULT_MAX_VERSIONS: usize = 10_000;

/// Sequence of versioned values; the oldest are dropped past `max_versions`
#[derive(Debug)]
struct Versioned<T> {
    kind: &'static str,
    /// (version, timepoint, value), versions ascending
    entries: VecDeque<(Version, u64, T)>,
    next_version: Version,
    max_versions: usize,
}

impl<T: Clone> Versioned<T> {
    fn new(kind: &'static str, max_versions: usize) -> Self {
        Self {
            kind,
            entries: VecDeque::new(),
            next_version: 1,
            max_versions: max_versions.max(1),
        }
    }

    fn push(&mut self, timepoint: u64, value: T) -> Version {
        let version = self.next_version;
        self.next_version += 1;
        self.entries.push_back((version, timepoint, value));
        while self.entries.len() > self.max_versions {
            if let Some((dropped, _, _)) = self.entries.pop_front() {
                debug!(kind = self.kind, version = dropped, "pruned oldest version");
            }
        }
        version
    }

    fn current_version(&self, timepoint: u64) -> Result<Version> {
        self.entries
            .iter()
            .rev()
            .find(|(_, stored_at, _)| *stored_at <= timepoint)
            .map(|(version, _, _)| *version)
            .ok_or_else(|| {
                ReserveError::NotFound(format!("no {} version at or before {}", self.kind, timepoint))
            })
    }

    fn get(&self, version: Version) -> Result<T> {
        self.entries
            .binary_search_by_key(&version, |(v, _, _)| *v)
            .map(|idx| self.entries[idx].2.clone())
            .map_err(|_| ReserveError::NotFound(format!("{} version {}", self.kind, version)))
    }

    fn range(&self, from: u64, to: u64) -> Vec<T> {
        self.entries
            .iter()
            .filter(|(_, stored_at, _)| (from..=to).contains(stored_at))
            .map(|(_, _, value)| value.clone())
            .collect()
    }
}

#[derive(Debug)]
struct Inner {
    prices: Versioned<AllPriceEntry>,
    rates: Versioned<AllRateEntry>,
    auth: Versioned<AuthDataSnapshot>,
    trade_history: Versioned<AllTradeHistory>,
    activities: HashMap<ActivityId, ActivityRecord>,
    exchange_status: ExchangesStatus,
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_MAX_VERSIONS)
    }

    /// Store keeping at most `max_versions` prices, rates, auth snapshots and
    /// trade histories each
    pub fn with_retention(max_versions: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                prices: Versioned::new("price", max_versions),
                rates: Versioned::new("rate", max_versions),
                auth: Versioned::new("auth data", max_versions),
                trade_history: Versioned::new("trade history", max_versions),
                activities: HashMap::new(),
                exchange_status: ExchangesStatus::new(),
            }),
        }
    }

    /// Number of auth snapshots currently retained
    pub async fn auth_versions(&self) -> usize {
        self.inner.read().await.auth.entries.len()
    }

    pub async fn get_activity(&self, id: &ActivityId) -> Option<ActivityRecord> {
        self.inner.read().await.activities.get(id).cloned()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store_price(&self, data: AllPriceEntry, timepoint: u64) -> Result<Version> {
        let version = self.inner.write().await.prices.push(timepoint, data);
        debug!(version, timepoint, "stored prices");
        Ok(version)
    }

    async fn store_rate(&self, data: AllRateEntry, timepoint: u64) -> Result<Version> {
        let version = self.inner.write().await.rates.push(timepoint, data);
        debug!(version, timepoint, "stored rates");
        Ok(version)
    }

    async fn store_auth_snapshot(
        &self,
        data: &AuthDataSnapshot,
        timepoint: u64,
    ) -> Result<Version> {
        let version = self.inner.write().await.auth.push(timepoint, data.clone());
        debug!(version, timepoint, valid = data.valid, "stored auth snapshot");
        Ok(version)
    }

    async fn store_trade_history(&self, data: AllTradeHistory, timepoint: u64) -> Result<Version> {
        Ok(self.inner.write().await.trade_history.push(timepoint, data))
    }

    async fn record_activity(&self, record: ActivityRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.activities.contains_key(&record.id) {
            return Err(ReserveError::Storage(format!(
                "activity {} already recorded",
                record.id
            )));
        }
        inner.activities.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_pending_activities(&self) -> Result<Vec<ActivityRecord>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<_> = inner
            .activities
            .values()
            .filter(|a| a.is_pending())
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.timestamp);
        Ok(pending)
    }

    async fn update_activity(&self, id: &ActivityId, record: &ActivityRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.activities.get_mut(id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(ReserveError::NotFound(format!("activity {}", id))),
        }
    }

    async fn get_all_records(&self, from: u64, to: u64) -> Result<Vec<ActivityRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner
            .activities
            .values()
            .filter(|a| (from..=to).contains(&a.timestamp))
            .cloned()
            .collect();
        records.sort_by_key(|a| a.timestamp);
        Ok(records)
    }

    async fn get_exchange_status(&self) -> Result<ExchangesStatus> {
        Ok(self.inner.read().await.exchange_status.clone())
    }

    async fn update_exchange_status(&self, data: ExchangesStatus) -> Result<()> {
        self.inner.write().await.exchange_status = data;
        Ok(())
    }

    async fn current_auth_data_version(&self, timepoint: u64) -> Result<Version> {
        self.inner.read().await.auth.current_version(timepoint)
    }

    async fn get_auth_data(&self, version: Version) -> Result<AuthDataSnapshot> {
        self.inner.read().await.auth.get(version)
    }

    async fn current_price_version(&self, timepoint: u64) -> Result<Version> {
        self.inner.read().await.prices.current_version(timepoint)
    }

    async fn get_all_prices(&self, version: Version) -> Result<AllPriceEntry> {
        self.inner.read().await.prices.get(version)
    }

    async fn get_one_price(&self, pair: &TokenPairId, version: Version) -> Result<OnePrice> {
        let prices = self.get_all_prices(version).await?;
        prices
            .data
            .get(pair)
            .cloned()
            .ok_or_else(|| ReserveError::NotFound(format!("pair {} in price version {}", pair, version)))
    }

    async fn current_rate_version(&self, timepoint: u64) -> Result<Version> {
        self.inner.read().await.rates.current_version(timepoint)
    }

    async fn get_rate(&self, version: Version) -> Result<AllRateEntry> {
        self.inner.read().await.rates.get(version)
    }

    async fn get_rates(&self, from: u64, to: u64) -> Result<Vec<AllRateEntry>> {
        Ok(self.inner.read().await.rates.range(from, to))
    }

    async fn get_trade_history(&self, timepoint: u64) -> Result<AllTradeHistory> {
        let inner = self.inner.read().await;
        let version = inner.trade_history.current_version(timepoint)?;
        inner.trade_history.get(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Activity, TradeParams, TradeResult, TradeSide, ExchangeStatus};
    use rust_decimal_macros::dec;

    fn trade(eid: &str, timepoint: u64) -> ActivityRecord {
        ActivityRecord::new(
            ActivityId::new(eid, timepoint),
            "binance",
            Activity::Trade {
                params: TradeParams {
                    exchange: "binance".into(),
                    side: TradeSide::Buy,
                    base: "KNC".into(),
                    quote: "ETH".into(),
                    rate: dec!(0.0021),
                    amount: dec!(100),
                },
                result: TradeResult::default(),
            },
        )
    }

    #[tokio::test]
    async fn auth_versions_increase_and_stay_readable() {
        let store = MemoryStorage::new();
        let mut first = AuthDataSnapshot::new(100);
        first.block = 1;
        let mut second = AuthDataSnapshot::new(200);
        second.block = 2;

        let v1 = store.store_auth_snapshot(&first, 100).await.unwrap();
        let v2 = store.store_auth_snapshot(&second, 200).await.unwrap();
        assert!(v2 > v1);

        assert_eq!(store.current_auth_data_version(150).await.unwrap(), v1);
        assert_eq!(store.current_auth_data_version(250).await.unwrap(), v2);
        assert_eq!(store.get_auth_data(v1).await.unwrap().block, 1);
        assert!(matches!(
            store.current_auth_data_version(50).await,
            Err(ReserveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn terminal_activities_leave_the_pending_list() {
        let store = MemoryStorage::new();
        store.record_activity(trade("o-1", 10)).await.unwrap();
        store.record_activity(trade("o-2", 20)).await.unwrap();

        let mut done = trade("o-1", 10);
        done.exchange_status = ExchangeStatus::Done;
        store.update_activity(&done.id, &done).await.unwrap();

        let pending = store.get_pending_activities().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id.eid, "o-2");
        assert_eq!(store.get_all_records(0, 100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn updating_unknown_activity_fails() {
        let store = MemoryStorage::new();
        let record = trade("ghost", 1);
        assert!(store.update_activity(&record.id, &record).await.is_err());
        store.record_activity(record.clone()).await.unwrap();
        assert!(matches!(
            store.record_activity(record).await,
            Err(ReserveError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn retention_drops_oldest_versions_only() {
        let store = MemoryStorage::with_retention(3);
        let mut versions = Vec::new();
        for t in 1..=5u64 {
            let mut snapshot = AuthDataSnapshot::new(t * 100);
            snapshot.block = t;
            versions.push(store.store_auth_snapshot(&snapshot, t * 100).await.unwrap());
        }
        assert_eq!(store.auth_versions().await, 3);

        assert_eq!(store.current_auth_data_version(1_000).await.unwrap(), versions[4]);
        assert_eq!(store.current_auth_data_version(350).await.unwrap(), versions[2]);
        assert_eq!(store.get_auth_data(versions[2]).await.unwrap().block, 3);
        assert!(matches!(
            store.get_auth_data(versions[0]).await,
            Err(ReserveError::NotFound(_))
        ));
        assert!(store.current_auth_data_version(250).await.is_err());

        let next = store.store_auth_snapshot(&AuthDataSnapshot::new(600), 600).await.unwrap();
        assert!(next > versions[4]);
    }

    #[tokio::test]
    async fn rates_range_is_inclusive() {
        let store = MemoryStorage::new();
        for t in [10, 20, 30] {
            store
                .store_rate(AllRateEntry { timestamp: t, ..Default::default() }, t)
                .await
                .unwrap();
        }
        let rates = store.get_rates(10, 20).await.unwrap();
        assert_eq!(rates.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![10, 20]);
    }
}
