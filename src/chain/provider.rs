//! Node access with multi-RPC support and automatic failover

use crate::config::NodeConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Inclusion data for a mined transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptInfo {
    pub block_number: u64,
    pub block_hash: H256,
    pub success: bool,
}

/// Everything the relay core reads from or sends to the node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> RelayerResult<u64>;

    /// Gas prices of every transaction in the block
    async fn block_gas_prices(&self, block_number: u64) -> RelayerResult<Vec<U256>>;

    /// Node's own `eth_gasPrice`
    async fn node_gas_price(&self) -> RelayerResult<U256>;

    async fn balance(&self, address: Address) -> RelayerResult<U256>;

    /// Transaction count including the node's pending pool
    async fn pending_nonce(&self, address: Address) -> RelayerResult<u64>;

    async fn storage_at(&self, address: Address, slot: H256) -> RelayerResult<H256>;

    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256>;

    /// Whether the node knows the transaction, pending or mined
    async fn has_transaction(&self, tx_hash: H256) -> RelayerResult<bool>;

    async fn receipt(&self, tx_hash: H256) -> RelayerResult<Option<ReceiptInfo>>;
}

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    pub fn new(config: &NodeConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in config.rpc_urls.iter().filter(|url| !url.trim().is_empty()) {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}", config.chain_id);
                }
                Err(e) => {
                    warn!("Failed to create provider for chain {}: {}", config.chain_id, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain_id: config.chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Run a read against each provider in turn until one answers
    async fn with_failover<'a, T, F, Fut>(&'a self, what: &str, call: F) -> RelayerResult<T>
    where
        F: Fn(&'a Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match call(self.http()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Failed to {} on chain {}: {}", what, self.chain_id, e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(RelayerError::ChainConnection {
            message: format!("All providers failed to {}: {}", what, last_error),
        })
    }

    /// Verify the node serves the configured chain
    pub async fn verify_chain_id(&self) -> RelayerResult<()> {
        let reported = self
            .with_failover("get chain id", |p| p.get_chainid())
            .await?;
        if reported != U256::from(self.chain_id) {
            return Err(RelayerError::Config(format!(
                "Node reports chain id {}, configured {}",
                reported, self.chain_id
            )));
        }
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain_id, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    async fn block_number(&self) -> RelayerResult<u64> {
        let block = self
            .with_failover("get block number", |p| p.get_block_number())
            .await?;
        Ok(block.as_u64())
    }

    async fn block_gas_prices(&self, block_number: u64) -> RelayerResult<Vec<U256>> {
        let block = self
            .with_failover("get block", |p| p.get_block_with_txs(block_number))
            .await?;

        Ok(block
            .map(|b| {
                b.transactions
                    .iter()
                    .filter_map(|tx| tx.gas_price)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn node_gas_price(&self) -> RelayerResult<U256> {
        self.with_failover("get gas price", |p| p.get_gas_price())
            .await
            .map_err(|e| RelayerError::OracleUnavailable(e.to_string()))
    }

    async fn balance(&self, address: Address) -> RelayerResult<U256> {
        self.with_failover("get balance", |p| p.get_balance(address, None))
            .await
    }

    async fn pending_nonce(&self, address: Address) -> RelayerResult<u64> {
        let count = self
            .with_failover("get transaction count", |p| {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
            })
            .await?;
        Ok(count.as_u64())
    }

    async fn storage_at(&self, address: Address, slot: H256) -> RelayerResult<H256> {
        self.with_failover("get storage", |p| p.get_storage_at(address, slot, None))
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        // No failover: a send error usually carries the node's verdict on the
        // transaction, which the dispatcher needs to see.
        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| RelayerError::Transaction(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn has_transaction(&self, tx_hash: H256) -> RelayerResult<bool> {
        let tx = self
            .with_failover("get transaction", |p| p.get_transaction(tx_hash))
            .await?;
        Ok(tx.is_some())
    }

    async fn receipt(&self, tx_hash: H256) -> RelayerResult<Option<ReceiptInfo>> {
        let receipt = self
            .with_failover("get transaction receipt", |p| {
                p.get_transaction_receipt(tx_hash)
            })
            .await?;

        Ok(receipt.and_then(|r| {
            let block_number = r.block_number?.as_u64();
            let block_hash = r.block_hash?;
            Some(ReceiptInfo {
                block_number,
                block_hash,
                success: r.status.map(|s| s.as_u64() == 1).unwrap_or(true),
            })
        }))
    }
}
