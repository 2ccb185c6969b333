use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::Address;
use tokio::sync::Mutex;
use tracing::debug;

use super::{with_timeout, NonceAllocator, NonceSource};
use crate::error::Result;

const NODE_TIMEOUT: Duration = Duration::from_secs(2);

/// Queries the node on every call and never issues below its pending nonce.
///
/// Tolerates transactions sent from the same account by other processes: the
/// node's pending nonce overtakes the local counter and becomes the new floor.
pub struct AutoIncreasing {
    source: Arc<dyn NonceSource>,
    address: Address,
    timeout: Duration,
    /// Next value to issue when the node is not ahead
    manual_nonce: Mutex<u64>,
}

impl AutoIncreasing {
    pub fn new(source: Arc<dyn NonceSource>, address: Address) -> Self {
        Self::with_node_timeout(source, address, NODE_TIMEOUT)
    }

    pub fn with_node_timeout(
        source: Arc<dyn NonceSource>,
        address: Address,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            address,
            timeout,
            manual_nonce: Mutex::new(0),
        }
    }
}

#[async_trait]
impl NonceAllocator for AutoIncreasing {
    fn address(&self) -> Address {
        self.address
    }

    async fn get_next_nonce(&self) -> Result<u64> {
        let mut manual = self.manual_nonce.lock().await;
        let node_nonce = with_timeout(
            self.timeout,
            "pending nonce",
            self.source.pending_nonce_at(self.address),
        )
        .await?;

        let next = if node_nonce > *manual {
            node_nonce
        } else {
            *manual
        };
        *manual = next + 1;

        debug!(address = ?self.address, node_nonce, nonce = next, "issued nonce");
        Ok(next)
    }

    async fn mined_nonce(&self) -> Result<u64> {
        with_timeout(self.timeout, "mined nonce", self.source.nonce_at(self.address)).await
    }
}
