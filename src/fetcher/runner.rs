//! Timer signals driving the poll loops

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{ReserveError, Result};
use crate::time::now_ms;

/// Data category with its own poll loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchCategory {
    Orderbook,
    AuthData,
    Rate,
    Block,
    TradeHistory,
}

impl FetchCategory {
    pub const ALL: [FetchCategory; 5] = [
        Self::Orderbook,
        Self::AuthData,
        Self::Rate,
        Self::Block,
        Self::TradeHistory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orderbook => "orderbook",
            Self::AuthData => "auth_data",
            Self::Rate => "rate",
            Self::Block => "block",
            Self::TradeHistory => "trade_history",
        }
    }
}

impl std::fmt::Display for FetchCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Emits one timepoint per signal; a closed ticker ends its loop
pub type Ticker = mpsc::Receiver<u64>;

#[async_trait]
pub trait FetcherRunner: Send + Sync {
    /// Hand out the ticker of `category`. Each ticker can be taken once.
    async fn take_ticker(&self, category: FetchCategory) -> Option<Ticker>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

fn channels() -> (HashMap<FetchCategory, mpsc::Sender<u64>>, HashMap<FetchCategory, Ticker>) {
    let mut senders = HashMap::new();
    let mut receivers = HashMap::new();
    for category in FetchCategory::ALL {
        // capacity 1: a loop still busy with the previous cycle coalesces ticks
        let (tx, rx) = mpsc::channel(1);
        senders.insert(category, tx);
        receivers.insert(category, rx);
    }
    (senders, receivers)
}

/// Interval-driven runner, one timer task per category
pub struct TickerRunner {
    intervals: HashMap<FetchCategory, Duration>,
    senders: Mutex<HashMap<FetchCategory, mpsc::Sender<u64>>>,
    receivers: Mutex<HashMap<FetchCategory, Ticker>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TickerRunner {
    pub fn new(intervals: HashMap<FetchCategory, Duration>) -> Self {
        let (senders, receivers) = channels();
        Self {
            intervals,
            senders: Mutex::new(senders),
            receivers: Mutex::new(receivers),
            handles: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl FetcherRunner for TickerRunner {
    async fn take_ticker(&self, category: FetchCategory) -> Option<Ticker> {
        self.receivers.lock().await.remove(&category)
    }

    async fn start(&self) -> Result<()> {
        let mut senders = self.senders.lock().await;
        if senders.is_empty() {
            return Err(ReserveError::Validation("runner already started".into()));
        }
        let mut handles = self.handles.lock().await;

        for (category, tx) in senders.drain() {
            let Some(period) = self.intervals.get(&category).copied() else {
                debug!(%category, "no interval configured, ticker stays silent");
                continue;
            };
            if period.is_zero() {
                return Err(ReserveError::Validation(format!(
                    "{} interval must be positive",
                    category
                )));
            }
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    match tx.try_send(now_ms()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!(%category, "previous cycle still running, tick dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            }));
        }
        info!(tickers = handles.len(), "fetcher runner started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // the timer tasks own the senders; aborting them closes every ticker
        for handle in self.handles.lock().await.drain(..) {
            handle.abort();
        }
        self.senders.lock().await.clear();
        info!("fetcher runner stopped");
        Ok(())
    }
}

/// Runner whose signals are fired by hand, for simulations and tests
pub struct ManualRunner {
    senders: Mutex<HashMap<FetchCategory, mpsc::Sender<u64>>>,
    receivers: Mutex<HashMap<FetchCategory, Ticker>>,
}

impl Default for ManualRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualRunner {
    pub fn new() -> Self {
        let (senders, receivers) = channels();
        Self {
            senders: Mutex::new(senders),
            receivers: Mutex::new(receivers),
        }
    }

    /// Fire one signal, waiting until the loop has room for it
    pub async fn tick(&self, category: FetchCategory, timepoint: u64) -> Result<()> {
        let tx = self
            .senders
            .lock()
            .await
            .get(&category)
            .cloned()
            .ok_or_else(|| ReserveError::Validation("runner stopped".into()))?;
        tx.send(timepoint)
            .await
            .map_err(|_| ReserveError::Internal(format!("{} loop is gone", category)))
    }
}

#[async_trait]
impl FetcherRunner for ManualRunner {
    async fn take_ticker(&self, category: FetchCategory) -> Option<Ticker> {
        self.receivers.lock().await.remove(&category)
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.senders.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_per_interval_and_closes_on_stop() {
        let runner = TickerRunner::new(
            [(FetchCategory::Block, Duration::from_secs(5))].into(),
        );
        let mut block = runner.take_ticker(FetchCategory::Block).await.unwrap();
        assert!(runner.take_ticker(FetchCategory::Block).await.is_none());

        runner.start().await.unwrap();
        assert!(block.recv().await.is_some());
        assert!(block.recv().await.is_some());

        runner.stop().await.unwrap();
        // drain a tick that may have been buffered before the abort
        while block.try_recv().is_ok() {}
        assert!(block.recv().await.is_none());
    }

    #[tokio::test]
    async fn unconfigured_categories_close_after_start() {
        let runner = TickerRunner::new(HashMap::new());
        let mut rate = runner.take_ticker(FetchCategory::Rate).await.unwrap();
        runner.start().await.unwrap();
        assert!(rate.recv().await.is_none());
        assert!(runner.start().await.is_err());
    }

    #[tokio::test]
    async fn manual_runner_delivers_timepoints() {
        let runner = ManualRunner::new();
        let mut auth = runner.take_ticker(FetchCategory::AuthData).await.unwrap();
        runner.tick(FetchCategory::AuthData, 42).await.unwrap();
        assert_eq!(auth.recv().await, Some(42));

        runner.stop().await.unwrap();
        assert!(runner.tick(FetchCategory::AuthData, 43).await.is_err());
        assert!(auth.recv().await.is_none());
    }
}
