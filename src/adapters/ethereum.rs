//! JSON-RPC node client
//!
//! Balances and rates are read in one call each through the wrapper
//! contract; ETH is read with `eth_getBalance`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{parse_abi, Detokenize};
use ethers::contract::BaseContract;
use ethers::providers::{Http, JsonRpcClient, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, Transaction, TransactionReceipt, TransactionRequest,
    H256, I256, U256,
};
use tracing::{debug, warn};

use crate::blockchain::{Blockchain, TxObservation};
use crate::config::TokenConfig;
use crate::domain::{AllRateEntry, BalanceEntry, RateEntry};
use crate::error::{ReserveError, Result};
use crate::nonce::{with_timeout, NonceAllocator, NonceSource};
use crate::time::now_ms;

const WRAPPER_ABI: &[&str] = &[
    "function getBalances(address reserve, address[] tokens) view returns (uint256[])",
    "function getTokenRates(address ratesContract, address[] tokens) view returns (uint256[], uint256[], int8[], int8[], uint256[])",
];

type RatesOutput = (Vec<U256>, Vec<U256>, Vec<I256>, Vec<I256>, Vec<U256>);

/// Node connection with a bound on every request
pub struct EthereumNode<P = Http> {
    provider: Provider<P>,
    timeout: Duration,
}

impl EthereumNode<Http> {
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| ReserveError::Validation(format!("node url {}: {}", url, e)))?;
        Ok(Self::new(provider, timeout))
    }
}

impl<P: JsonRpcClient + 'static> EthereumNode<P> {
    pub fn new(provider: Provider<P>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    async fn nonce(&self, address: Address, block: BlockNumber) -> Result<u64> {
        let count = with_timeout(self.timeout, "eth_getTransactionCount", async {
            self.provider
                .get_transaction_count(address, Some(block.into()))
                .await
                .map_err(ReserveError::from)
        })
        .await?;
        Ok(count.low_u64())
    }

    async fn block_number(&self) -> Result<u64> {
        let block = with_timeout(self.timeout, "eth_blockNumber", async {
            self.provider.get_block_number().await.map_err(ReserveError::from)
        })
        .await?;
        Ok(block.as_u64())
    }

    async fn transaction(&self, tx: H256) -> Result<Option<Transaction>> {
        with_timeout(self.timeout, "eth_getTransactionByHash", async {
            self.provider.get_transaction(tx).await.map_err(ReserveError::from)
        })
        .await
    }

    async fn receipt(&self, tx: H256) -> Result<Option<TransactionReceipt>> {
        with_timeout(self.timeout, "eth_getTransactionReceipt", async {
            self.provider.get_transaction_receipt(tx).await.map_err(ReserveError::from)
        })
        .await
    }

    async fn balance(&self, address: Address, block: Option<BlockId>) -> Result<U256> {
        with_timeout(self.timeout, "eth_getBalance", async {
            self.provider.get_balance(address, block).await.map_err(ReserveError::from)
        })
        .await
    }

    async fn call(&self, to: Address, data: Bytes, block: Option<BlockId>) -> Result<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        with_timeout(self.timeout, "eth_call", async {
            self.provider.call(&tx, block).await.map_err(ReserveError::from)
        })
        .await
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> NonceSource for EthereumNode<P> {
    async fn pending_nonce_at(&self, address: Address) -> Result<u64> {
        self.nonce(address, BlockNumber::Pending).await
    }

    async fn nonce_at(&self, address: Address) -> Result<u64> {
        self.nonce(address, BlockNumber::Latest).await
    }
}

/// Classify a transaction from its node lookup and receipt
pub fn observe(
    tx: Option<&Transaction>,
    receipt: Option<&TransactionReceipt>,
) -> (TxObservation, u64) {
    let Some(tx) = tx else {
        return (TxObservation::Lost, 0);
    };
    if tx.block_number.is_none() {
        return (TxObservation::Pending, 0);
    }
    match receipt {
        None => (TxObservation::Pending, 0),
        Some(receipt) => {
            let block = receipt.block_number.map(|b| b.as_u64()).unwrap_or_default();
            if receipt.status == Some(1u64.into()) {
                (TxObservation::Mined, block)
            } else {
                (TxObservation::Failed, block)
            }
        }
    }
}

fn block_id(block: u64) -> Option<BlockId> {
    (block != 0).then(|| BlockNumber::Number(block.into()).into())
}

/// Decode the wrapper's rate arrays into per-token entries
pub fn decode_rates(
    wrapper: &BaseContract,
    tokens: &[TokenConfig],
    output: Bytes,
) -> Result<HashMap<String, RateEntry>> {
    let (base_buys, base_sells, compact_buys, compact_sells, blocks): RatesOutput =
        wrapper.decode_output("getTokenRates", output)?;
    let lengths = [
        base_buys.len(),
        base_sells.len(),
        compact_buys.len(),
        compact_sells.len(),
        blocks.len(),
    ];
    if lengths.iter().any(|len| *len != tokens.len()) {
        return Err(ReserveError::Node(format!(
            "getTokenRates returned {:?} entries for {} tokens",
            lengths,
            tokens.len()
        )));
    }

    Ok(tokens
        .iter()
        .enumerate()
        .map(|(i, token)| {
            (
                token.symbol.clone(),
                RateEntry {
                    base_buy: base_buys[i],
                    compact_buy: compact_buys[i].low_i32() as i8,
                    base_sell: base_sells[i],
                    compact_sell: compact_sells[i].low_i32() as i8,
                    block: blocks[i].low_u64(),
                },
            )
        })
        .collect())
}

fn decode<D: Detokenize>(wrapper: &BaseContract, name: &str, output: Bytes) -> Result<D> {
    Ok(wrapper.decode_output(name, output)?)
}

pub struct EthereumBlockchain<P = Http> {
    node: Arc<EthereumNode<P>>,
    wrapper: BaseContract,
    wrapper_address: Address,
    pricing_address: Address,
    tokens: Vec<TokenConfig>,
    /// Allocator of the account signing set-rates
    pricing_nonce: Arc<dyn NonceAllocator>,
}

impl<P: JsonRpcClient + 'static> EthereumBlockchain<P> {
    pub fn new(
        node: Arc<EthereumNode<P>>,
        wrapper_address: Address,
        pricing_address: Address,
        tokens: Vec<TokenConfig>,
        pricing_nonce: Arc<dyn NonceAllocator>,
    ) -> Result<Self> {
        let abi = parse_abi(WRAPPER_ABI).map_err(|e| ReserveError::Internal(e.to_string()))?;
        Ok(Self {
            node,
            wrapper: BaseContract::from(abi),
            wrapper_address,
            pricing_address,
            tokens,
            pricing_nonce,
        })
    }

    fn is_ether(token: &TokenConfig) -> bool {
        token.symbol == "ETH"
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> Blockchain for EthereumBlockchain<P> {
    async fn current_block(&self) -> Result<u64> {
        self.node.block_number().await
    }

    async fn tx_status(&self, tx: H256) -> Result<(TxObservation, u64)> {
        let found = self.node.transaction(tx).await?;
        let receipt = match &found {
            Some(t) if t.block_number.is_some() => self.node.receipt(tx).await?,
            _ => None,
        };
        let (observation, block) = observe(found.as_ref(), receipt.as_ref());
        debug!(%tx, observation = observation.as_str(), block, "tx status");
        Ok((observation, block))
    }

    async fn fetch_balance_data(
        &self,
        reserve: Address,
        block: u64,
    ) -> Result<HashMap<String, BalanceEntry>> {
        let at = block_id(block);
        let timestamp = now_ms();
        let (ether, erc20): (Vec<_>, Vec<_>) = self.tokens.iter().partition(|t| Self::is_ether(t));

        let mut result = HashMap::with_capacity(self.tokens.len());
        if !ether.is_empty() {
            let balance = self.node.balance(reserve, at).await?;
            for token in ether {
                result.insert(
                    token.symbol.clone(),
                    BalanceEntry {
                        valid: true,
                        error: String::new(),
                        timestamp,
                        return_time: now_ms(),
                        balance,
                    },
                );
            }
        }
        if erc20.is_empty() {
            return Ok(result);
        }

        let addresses: Vec<Address> = erc20.iter().map(|t| t.address).collect();
        let data = self.wrapper.encode("getBalances", (reserve, addresses))?;
        let output = self.node.call(self.wrapper_address, data, at).await?;
        let balances: Vec<U256> = decode(&self.wrapper, "getBalances", output)?;
        if balances.len() != erc20.len() {
            warn!(
                expected = erc20.len(),
                got = balances.len(),
                "wrapper returned unexpected balance count"
            );
            return Err(ReserveError::Node(format!(
                "getBalances returned {} entries for {} tokens",
                balances.len(),
                erc20.len()
            )));
        }
        let return_time = now_ms();
        for (token, balance) in erc20.iter().zip(balances) {
            result.insert(
                token.symbol.clone(),
                BalanceEntry {
                    valid: true,
                    error: String::new(),
                    timestamp,
                    return_time,
                    balance,
                },
            );
        }
        Ok(result)
    }

    async fn fetch_rates(&self, from_block: u64, to_block: u64) -> Result<AllRateEntry> {
        let timestamp = now_ms();
        let tokens: Vec<TokenConfig> = self
            .tokens
            .iter()
            .filter(|t| !Self::is_ether(t))
            .cloned()
            .collect();
        let addresses: Vec<Address> = tokens.iter().map(|t| t.address).collect();
        let data = self
            .wrapper
            .encode("getTokenRates", (self.pricing_address, addresses))?;
        let output = self
            .node
            .call(self.wrapper_address, data, block_id(to_block))
            .await?;
        let data = decode_rates(&self.wrapper, &tokens, output)?;
        debug!(from_block, to_block, tokens = data.len(), "rates read");

        Ok(AllRateEntry {
            valid: true,
            error: String::new(),
            timestamp,
            return_time: now_ms(),
            data,
            block_number: to_block,
        })
    }

    async fn set_rate_mined_nonce(&self) -> Result<u64> {
        self.pricing_nonce.mined_nonce().await
    }
}
