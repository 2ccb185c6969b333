use thiserror::Error;

/// Main error type for the reserve data plane
#[derive(Error, Debug)]
pub enum ReserveError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Node errors
    #[error("Node error: {0}")]
    Node(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // Venue errors
    #[error("Exchange {exchange} error: {reason}")]
    Exchange { exchange: String, reason: String },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Reconciliation errors
    #[error("Source {source_name} did not converge after {rounds} rounds")]
    Inconsistent { source_name: String, rounds: u32 },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ReserveError {
    pub fn exchange(exchange: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Exchange {
            exchange: exchange.into(),
            reason: reason.to_string(),
        }
    }

    /// Transient failures are retried on the next cycle or the next caller need
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Node(_) | Self::Timeout(_) | Self::Exchange { .. } | Self::Inconsistent { .. }
        )
    }
}

impl From<ethers::providers::ProviderError> for ReserveError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        ReserveError::Node(err.to_string())
    }
}

impl From<ethers::abi::AbiError> for ReserveError {
    fn from(err: ethers::abi::AbiError) -> Self {
        ReserveError::Node(format!("abi: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ReserveError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ReserveError::Timeout(err.to_string())
    }
}

/// Result type alias for ReserveError
pub type Result<T> = std::result::Result<T, ReserveError>;
