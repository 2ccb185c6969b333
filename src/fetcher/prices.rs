use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::domain::{AllPriceEntry, ExchangeId, ExchangePrice, OnePrice, TokenPairId};

/// Order books contributed by concurrent venue tasks, one pair at a time
#[derive(Debug, Default)]
pub struct ConcurrentPriceData {
    data: DashMap<TokenPairId, OnePrice>,
    block: AtomicU64,
}

impl ConcurrentPriceData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_one_price(&self, exchange: ExchangeId, pair: TokenPairId, price: ExchangePrice) {
        self.data.entry(pair).or_default().insert(exchange, price);
    }

    pub fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::Relaxed);
    }

    pub fn into_entry(self) -> AllPriceEntry {
        AllPriceEntry {
            block: self.block.into_inner(),
            data: self.data.into_iter().collect(),
        }
    }
}
