//! Nonce allocation for outgoing transactions
//!
//! One allocator per signing account. Allocators serialize callers behind a
//! single lock so every caller receives a distinct, strictly increasing
//! nonce. Two strategies share the [`NonceAllocator`] contract:
//!
//! - [`AutoIncreasing`] asks the node for the pending nonce on every call and
//!   adopts it when the node is ahead of the local counter.
//! - [`TimeWindow`] skips the node while calls arrive in a burst and only
//!   re-syncs once the burst has ended.
//!
//! A failed node query is returned to the caller. Submitting with a guessed
//! nonce could duplicate or drop a fund-moving transaction.

mod auto_increasing;
mod time_window;

pub use auto_increasing::AutoIncreasing;
pub use time_window::TimeWindow;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::Address;

use crate::error::{ReserveError, Result};

/// Node RPC calls the allocators depend on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NonceSource: Send + Sync {
    /// Nonce including transactions still in the node's pool
    async fn pending_nonce_at(&self, address: Address) -> Result<u64>;

    /// Nonce of the latest mined block
    async fn nonce_at(&self, address: Address) -> Result<u64>;
}

#[async_trait]
pub trait NonceAllocator: Send + Sync {
    fn address(&self) -> Address;

    /// Next nonce to sign with. Never returns the same value twice.
    async fn get_next_nonce(&self) -> Result<u64>;

    /// Confirmed nonce; every transaction below it has been mined
    async fn mined_nonce(&self) -> Result<u64>;
}

/// Bound a node query so one unresponsive node cannot hold the allocator lock
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ReserveError::Timeout(format!("{} after {}ms", what, timeout.as_millis())))?
}
