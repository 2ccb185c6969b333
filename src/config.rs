use config::{Config, ConfigError, Environment, File};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::fetcher::{DoubleCheckPolicy, FetchCategory, FetcherConfig};
use crate::storage::DEFAULT_MAX_VERSIONS;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    pub reserve: ReserveConfig,
    #[serde(default)]
    pub fetcher: FetcherSettings,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// JSON-RPC endpoint
    pub url: String,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_node_timeout")]
    pub timeout_ms: u64,
}

fn default_node_timeout() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReserveConfig {
    /// Reserve contract holding the inventory
    pub reserve_address: Address,
    /// Wrapper contract used for batched balance and rate reads
    pub wrapper_address: Address,
    /// Pricing contract the rates are set on
    pub pricing_address: Address,
    /// Account signing set-rates transactions
    pub pricing_operator: Address,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

impl ReserveConfig {
    pub fn decimals(&self) -> HashMap<String, u32> {
        self.tokens
            .iter()
            .map(|t| (t.symbol.clone(), t.decimals))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: Address,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

fn default_decimals() -> u32 {
    18
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetcherSettings {
    #[serde(default = "default_orderbook_interval")]
    pub orderbook_interval_ms: u64,
    #[serde(default = "default_auth_data_interval")]
    pub auth_data_interval_ms: u64,
    #[serde(default = "default_rate_interval")]
    pub rate_interval_ms: u64,
    #[serde(default = "default_block_interval")]
    pub block_interval_ms: u64,
    #[serde(default = "default_trade_history_interval")]
    pub trade_history_interval_ms: u64,
    /// Delay after a new block before rates are read
    #[serde(default = "default_rate_delay")]
    pub rate_delay_after_block_ms: u64,
    /// Unobserved transactions older than this are failed
    #[serde(default = "default_lost_tx_timeout")]
    pub lost_tx_timeout_secs: u64,
    /// Unset keeps retrying until statuses converge
    #[serde(default)]
    pub double_check_max_rounds: Option<u32>,
    #[serde(default)]
    pub double_check_backoff_ms: u64,
    #[serde(default)]
    pub simulation_mode: bool,
}

fn default_orderbook_interval() -> u64 {
    7000
}

fn default_auth_data_interval() -> u64 {
    5000
}

fn default_rate_interval() -> u64 {
    3000
}

fn default_block_interval() -> u64 {
    5000
}

fn default_trade_history_interval() -> u64 {
    60_000
}

fn default_rate_delay() -> u64 {
    5000
}

fn default_lost_tx_timeout() -> u64 {
    900
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            orderbook_interval_ms: default_orderbook_interval(),
            auth_data_interval_ms: default_auth_data_interval(),
            rate_interval_ms: default_rate_interval(),
            block_interval_ms: default_block_interval(),
            trade_history_interval_ms: default_trade_history_interval(),
            rate_delay_after_block_ms: default_rate_delay(),
            lost_tx_timeout_secs: default_lost_tx_timeout(),
            double_check_max_rounds: None,
            double_check_backoff_ms: 0,
            simulation_mode: false,
        }
    }
}

impl FetcherSettings {
    /// Ticker period per poll loop
    pub fn intervals(&self) -> HashMap<FetchCategory, Duration> {
        [
            (FetchCategory::Orderbook, self.orderbook_interval_ms),
            (FetchCategory::AuthData, self.auth_data_interval_ms),
            (FetchCategory::Rate, self.rate_interval_ms),
            (FetchCategory::Block, self.block_interval_ms),
            (FetchCategory::TradeHistory, self.trade_history_interval_ms),
        ]
        .into_iter()
        .map(|(category, ms)| (category, Duration::from_millis(ms)))
        .collect()
    }

    pub fn to_fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            rate_delay_after_block: Duration::from_millis(self.rate_delay_after_block_ms),
            lost_tx_timeout: Duration::from_secs(self.lost_tx_timeout_secs),
            double_check: DoubleCheckPolicy {
                max_rounds: self.double_check_max_rounds,
                backoff: Duration::from_millis(self.double_check_backoff_ms),
            },
            simulation_mode: self.simulation_mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NonceStrategy {
    #[default]
    AutoIncreasing,
    TimeWindow,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NonceConfig {
    #[serde(default)]
    pub strategy: NonceStrategy,
    /// Burst window of the time-window strategy
    #[serde(default = "default_nonce_window")]
    pub window_ms: u64,
    #[serde(default = "default_nonce_timeout")]
    pub node_timeout_ms: u64,
}

fn default_nonce_window() -> u64 {
    2000
}

fn default_nonce_timeout() -> u64 {
    2000
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            strategy: NonceStrategy::default(),
            window_ms: default_nonce_window(),
            node_timeout_ms: default_nonce_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Versions retained per record kind; older ones are dropped
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
}

fn default_max_versions() -> usize {
    DEFAULT_MAX_VERSIONS
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_versions: default_max_versions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rotated log file
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("node.timeout_ms", default_node_timeout())?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // environment-specific overrides, e.g. config/production.toml
            .add_source(
                File::from(config_dir.join(
                    std::env::var("RESERVE_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // RESERVE_NODE__URL, RESERVE_FETCHER__SIMULATION_MODE, ...
            .add_source(
                Environment::with_prefix("RESERVE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node.url.is_empty() {
            errors.push("node.url must be set".to_string());
        }
        if self.node.timeout_ms == 0 {
            errors.push("node.timeout_ms must be positive".to_string());
        }

        for (category, period) in self.fetcher.intervals() {
            if period.is_zero() {
                errors.push(format!("fetcher {} interval must be positive", category));
            }
        }
        if self.fetcher.double_check_max_rounds == Some(0) {
            errors.push("fetcher.double_check_max_rounds must be at least 1".to_string());
        }

        if self.storage.max_versions == 0 {
            errors.push("storage.max_versions must be positive".to_string());
        }

        if self.nonce.strategy == NonceStrategy::TimeWindow && self.nonce.window_ms == 0 {
            errors.push("nonce.window_ms must be positive for time_window".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for token in &self.reserve.tokens {
            if !seen.insert(token.symbol.as_str()) {
                errors.push(format!("token {} listed twice", token.symbol));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[node]
url = "http://localhost:8545"

[reserve]
reserve_address = "0x63825c174ab367968ec60f061753d3bbd36a0d8f"
wrapper_address = "0x6172afc8c00c46e0d07ce3af203828198194620a"
pricing_address = "0x798abda6cc246d0edba912092a2a3dbd3d11191b"
pricing_operator = "0x8bc3da587def887b5c822105729ee1d6af05a5ca"

[[reserve.tokens]]
symbol = "KNC"
address = "0xdd974d5c2e2928dea5f71b9825b8b646686bd200"

[[reserve.tokens]]
symbol = "DGX"
address = "0x4f3afec4e5a3f2a6a1a411def7d7dfe50ee057bf"
decimals = 9

[fetcher]
double_check_max_rounds = 20
simulation_mode = true
"#;

    fn parse(toml: &str) -> AppConfig {
        Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn sample_config_fills_defaults() {
        let config = parse(SAMPLE);
        assert_eq!(config.node.timeout_ms, 3000);
        assert_eq!(config.reserve.decimals()["KNC"], 18);
        assert_eq!(config.reserve.decimals()["DGX"], 9);
        assert_eq!(config.nonce.strategy, NonceStrategy::AutoIncreasing);
        assert_eq!(config.storage.max_versions, DEFAULT_MAX_VERSIONS);

        let fetcher = config.fetcher.to_fetcher_config();
        assert!(fetcher.simulation_mode);
        assert_eq!(fetcher.rate_delay_after_block, Duration::from_secs(5));
        assert_eq!(fetcher.lost_tx_timeout, Duration::from_secs(900));
        assert_eq!(fetcher.double_check.max_rounds, Some(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = parse(SAMPLE);
        config.fetcher.rate_interval_ms = 0;
        config.fetcher.double_check_max_rounds = Some(0);
        config.reserve.tokens.push(config.reserve.tokens[0].clone());

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("rate interval")));
    }
}
