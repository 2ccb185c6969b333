pub mod adapters;
pub mod blockchain;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod fetcher;
pub mod nonce;
pub mod reserve;
pub mod storage;
pub mod time;

pub use config::AppConfig;
pub use error::{ReserveError, Result};
pub use fetcher::{Fetcher, FetcherConfig, FetcherRunner, ManualRunner, TickerRunner};
pub use nonce::{AutoIncreasing, NonceAllocator, NonceSource, TimeWindow};
pub use reserve::ReserveData;
pub use storage::{MemoryStorage, Storage};
