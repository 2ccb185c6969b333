use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::Address;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{with_timeout, NonceAllocator, NonceSource};
use crate::error::Result;

const NODE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct WindowState {
    /// Last issued nonce
    manual_nonce: u64,
    last_issued: Option<Instant>,
}

/// Issues locally while calls arrive within `window` of each other.
///
/// A node that has not indexed the previous submission yet reports a stale
/// pending nonce, so a burst is served from the local counter and the node is
/// only consulted once the burst is over.
pub struct TimeWindow {
    source: Arc<dyn NonceSource>,
    address: Address,
    timeout: Duration,
    window: Duration,
    state: Mutex<WindowState>,
}

impl TimeWindow {
    pub fn new(source: Arc<dyn NonceSource>, address: Address) -> Self {
        Self::with_window(source, address, DEFAULT_WINDOW, NODE_TIMEOUT)
    }

    pub fn with_window(
        source: Arc<dyn NonceSource>,
        address: Address,
        window: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            address,
            timeout,
            window,
            state: Mutex::new(WindowState::default()),
        }
    }
}

#[async_trait]
impl NonceAllocator for TimeWindow {
    fn address(&self) -> Address {
        self.address
    }

    async fn get_next_nonce(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let in_burst = state
            .last_issued
            .is_some_and(|last| now.duration_since(last) < self.window);
        if in_burst {
            state.manual_nonce += 1;
            state.last_issued = Some(now);
            debug!(address = ?self.address, nonce = state.manual_nonce, "issued nonce within window");
            return Ok(state.manual_nonce);
        }

        let node_nonce = with_timeout(
            self.timeout,
            "pending nonce",
            self.source.pending_nonce_at(self.address),
        )
        .await?;
        // a node that is still behind our last submission must not pull the counter back
        let nonce = match state.last_issued {
            Some(_) => node_nonce.max(state.manual_nonce + 1),
            None => node_nonce,
        };
        state.manual_nonce = nonce;
        state.last_issued = Some(now);
        debug!(address = ?self.address, node_nonce, nonce, "issued nonce after resync");
        Ok(nonce)
    }

    async fn mined_nonce(&self) -> Result<u64> {
        with_timeout(self.timeout, "mined nonce", self.source.nonce_at(self.address)).await
    }
}
