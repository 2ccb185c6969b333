//! Fetch orchestrator
//!
//! One poll loop per [`FetchCategory`], each woken by its runner ticker.
//! Within a cycle every venue task runs concurrently and the cycle only
//! commits after all of them returned.

mod committer;
mod prices;
mod resolver;
mod runner;

pub use committer::{CycleResults, SnapshotCommitter};
pub use prices::ConcurrentPriceData;
pub use resolver::{
    double_check, fetch_status_from_blockchain, fetch_status_from_exchange, next_mining_status,
    ChainSource, Consistent, DoubleCheckPolicy, ExchangeSource, StatusSource, LOST_TX_TIMEOUT,
};
pub use runner::{FetchCategory, FetcherRunner, ManualRunner, Ticker, TickerRunner};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::Address;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::blockchain::Blockchain;
use crate::domain::{
    AllRateEntry, AllTradeHistory, AuthDataSnapshot, EBalanceEntry, ExStatus, StatusMap, Version,
};
use crate::error::Result;
use crate::exchange::Exchange;
use crate::storage::Storage;
use crate::time::now_ms;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Rates are only read this long after a new block was observed
    pub rate_delay_after_block: Duration,
    pub lost_tx_timeout: Duration,
    pub double_check: DoubleCheckPolicy,
    /// Reads rates from block 0 and skips the block gate
    pub simulation_mode: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            rate_delay_after_block: Duration::from_secs(5),
            lost_tx_timeout: LOST_TX_TIMEOUT,
            double_check: DoubleCheckPolicy::default(),
            simulation_mode: false,
        }
    }
}

/// Latest observed block height and when it was first seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockState {
    pub block: u64,
    pub updated_at: u64,
}

pub struct Fetcher {
    storage: Arc<dyn Storage>,
    committer: SnapshotCommitter,
    exchanges: Vec<Arc<dyn Exchange>>,
    blockchain: Arc<dyn Blockchain>,
    runner: Arc<dyn FetcherRunner>,
    reserve_address: Address,
    config: FetcherConfig,
    // written by the block loop only
    block_state: watch::Sender<BlockState>,
    shutdown: watch::Sender<bool>,
}

impl Fetcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        blockchain: Arc<dyn Blockchain>,
        runner: Arc<dyn FetcherRunner>,
        reserve_address: Address,
        config: FetcherConfig,
    ) -> Self {
        Self {
            committer: SnapshotCommitter::new(storage.clone()),
            storage,
            exchanges: Vec::new(),
            blockchain,
            runner,
            reserve_address,
            config,
            block_state: watch::channel(BlockState::default()).0,
            shutdown: watch::channel(false).0,
        }
    }

    /// Register a venue; its status entry starts out as up
    pub async fn add_exchange(&mut self, exchange: Arc<dyn Exchange>) -> Result<()> {
        let id = exchange.id().to_string();
        let mut statuses = match self.storage.get_exchange_status().await {
            Ok(statuses) => statuses,
            Err(e) => {
                debug!(error = %e, "no exchange status yet");
                HashMap::new()
            }
        };
        statuses.entry(id.clone()).or_insert_with(|| {
            debug!(exchange = %id, "initialising exchange status as up");
            ExStatus {
                timestamp: now_ms(),
                status: true,
            }
        });
        self.storage.update_exchange_status(statuses).await?;
        self.exchanges.push(exchange);
        Ok(())
    }

    pub fn exchanges(&self) -> &[Arc<dyn Exchange>] {
        &self.exchanges
    }

    pub fn block_state(&self) -> BlockState {
        *self.block_state.borrow()
    }

    /// Subscription to block height changes
    pub fn subscribe_blocks(&self) -> watch::Receiver<BlockState> {
        self.block_state.subscribe()
    }

    /// Start the runner and spawn every poll loop
    pub async fn run(self: Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        info!(exchanges = self.exchanges.len(), "fetcher starting");
        self.fetch_current_block(now_ms()).await;
        self.runner.start().await?;

        let mut handles = Vec::new();
        for category in FetchCategory::ALL {
            let Some(ticker) = self.runner.take_ticker(category).await else {
                warn!(%category, "ticker already taken, loop not started");
                continue;
            };
            let fetcher = self.clone();
            handles.push(tokio::spawn(async move {
                fetcher.poll_loop(category, ticker).await;
            }));
        }
        info!(loops = handles.len(), "fetcher running");
        Ok(handles)
    }

    /// Stop the runner and let every loop exit after its current cycle
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        self.runner.stop().await?;
        info!("fetcher stopped");
        Ok(())
    }

    async fn poll_loop(&self, category: FetchCategory, mut ticker: Ticker) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            // a started cycle runs to completion, shutdown is only seen between cycles
            let timepoint = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                tick = ticker.recv() => match tick {
                    Some(timepoint) => timepoint,
                    None => break,
                },
            };
            debug!(%category, timepoint, "tick");
            self.run_cycle(category, timepoint).await;
        }
        info!(%category, "poll loop exited");
    }

    async fn run_cycle(&self, category: FetchCategory, timepoint: u64) {
        match category {
            FetchCategory::Block => self.fetch_current_block(timepoint).await,
            FetchCategory::Rate => self.fetch_rate(timepoint).await,
            FetchCategory::Orderbook => self.fetch_orderbook(timepoint).await,
            FetchCategory::TradeHistory => self.fetch_all_trade_history(timepoint).await,
            FetchCategory::AuthData => {
                if let Err(e) = self.fetch_all_auth_data(timepoint).await {
                    error!(timepoint, error = %e, "auth data cycle failed");
                }
            }
        }
    }

    /// Update the block height; a failed read keeps the previous state
    pub async fn fetch_current_block(&self, timepoint: u64) {
        match self.blockchain.current_block().await {
            Ok(block) => {
                let changed = self.block_state.send_if_modified(|state| {
                    if state.block == block {
                        return false;
                    }
                    *state = BlockState {
                        block,
                        updated_at: now_ms(),
                    };
                    true
                });
                if changed {
                    debug!(block, timepoint, "new block observed");
                }
            }
            Err(e) => warn!(timepoint, error = %e, "fetching current block failed, keeping previous"),
        }
    }

    pub async fn fetch_rate(&self, timepoint: u64) {
        let BlockState { block, updated_at } = self.block_state();
        let (from, to) = if self.config.simulation_mode {
            (0, block)
        } else {
            let since_block = timepoint.saturating_sub(updated_at);
            if block == 0 || since_block < self.config.rate_delay_after_block.as_millis() as u64 {
                debug!(block, since_block, "block too fresh, rates not fetched");
                return;
            }
            (block - 1, block)
        };

        let data = match self.blockchain.fetch_rates(from, to).await {
            Ok(data) => data,
            Err(e) => {
                warn!(from, to, error = %e, "fetching rates failed");
                AllRateEntry {
                    valid: false,
                    error: e.to_string(),
                    timestamp: timepoint,
                    return_time: now_ms(),
                    ..Default::default()
                }
            }
        };
        if let Err(e) = self.storage.store_rate(data, timepoint).await {
            error!(timepoint, error = %e, "storing rates failed");
        }
    }

    pub async fn fetch_orderbook(&self, timepoint: u64) {
        let data = ConcurrentPriceData::new();
        join_all(self.exchanges.iter().map(|exchange| {
            let data = &data;
            async move {
                match exchange.fetch_price_data(timepoint).await {
                    Ok(prices) => {
                        for (pair, price) in prices {
                            data.set_one_price(exchange.id(), pair, price);
                        }
                    }
                    Err(e) => warn!(exchange = %exchange.name(), error = %e, "fetching prices failed"),
                }
            }
        }))
        .await;

        data.set_block(self.block_state().block);
        if let Err(e) = self.storage.store_price(data.into_entry(), timepoint).await {
            error!(timepoint, error = %e, "storing prices failed");
        }
    }

    pub async fn fetch_all_trade_history(&self, timepoint: u64) {
        let results = join_all(self.exchanges.iter().map(|exchange| async move {
            (exchange.id(), exchange.fetch_trade_history(timepoint).await)
        }))
        .await;

        let mut history = AllTradeHistory {
            timestamp: now_ms(),
            data: HashMap::new(),
        };
        for (id, result) in results {
            match result {
                Ok(trades) => {
                    history.data.insert(id, trades);
                }
                Err(e) => warn!(exchange = %id, error = %e, "fetching trade history failed"),
            }
        }
        if let Err(e) = self.storage.store_trade_history(history, timepoint).await {
            error!(timepoint, error = %e, "storing trade history failed");
        }
    }

    /// One balances-and-activities cycle, committed as a new auth snapshot
    pub async fn fetch_all_auth_data(&self, timepoint: u64) -> Result<Version> {
        let mut snapshot = AuthDataSnapshot::new(now_ms());
        let mut pendings = self.storage.get_pending_activities().await?;
        debug!(pending = pendings.len(), timepoint, "auth data cycle");

        let mut results = CycleResults::default();
        let outcomes = join_all(self.exchanges.iter().map(|exchange| {
            let pendings = &pendings;
            let policy = &self.config.double_check;
            async move {
                let source = ExchangeSource {
                    exchange: exchange.as_ref(),
                    pendings,
                    timepoint,
                };
                (exchange.id(), double_check(&source, policy).await)
            }
        }))
        .await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(consistent) => {
                    results.exchange_balances.insert(id, consistent.balances);
                    results.exchange_statuses.extend(consistent.statuses);
                }
                Err(e) => {
                    warn!(exchange = %id, error = %e, "exchange auth data failed");
                    results
                        .exchange_balances
                        .insert(id, EBalanceEntry::failed(e.to_string(), now_ms()));
                }
            }
        }

        backfill_from_exchange(&mut pendings, &results.exchange_statuses);

        let chain = ChainSource {
            blockchain: self.blockchain.as_ref(),
            pendings: &pendings,
            reserve: self.reserve_address,
            now: now_ms(),
            lost_timeout: self.config.lost_tx_timeout,
        };
        match double_check(&chain, &self.config.double_check).await {
            Ok(consistent) => {
                results.reserve_balances = Ok(consistent.balances);
                results.chain_statuses = consistent.statuses;
            }
            Err(e) => {
                warn!(error = %e, "reserve auth data failed");
                results.reserve_balances = Err(e.to_string());
            }
        }

        snapshot.block = self.block_state().block;
        snapshot.return_time = now_ms();
        self.committer
            .commit(snapshot, results, pendings, timepoint)
            .await
    }
}

/// Withdrawals learn their tx from the venue; copy it in before the chain
/// side resolves, so mining status is found in the same cycle
fn backfill_from_exchange(pendings: &mut [crate::domain::ActivityRecord], statuses: &StatusMap) {
    for activity in pendings.iter_mut() {
        if let Some(status) = statuses.get(&activity.id) {
            if activity.activity.backfill_tx(&status.tx) {
                debug!(activity = %activity.id, tx = %status.tx, "tx back-filled from exchange");
            }
        }
    }
}
