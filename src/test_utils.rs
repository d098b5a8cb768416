//! Shared fixtures for unit tests

use crate::alerts::AlertSink;
use crate::chain::{ChainClient, ReceiptInfo};
use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Well-known development keys
pub const FUNDER_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
pub const FUNDER_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
pub const SENDER_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
pub const SENDER_ADDRESS: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

/// Safe v1.0.0 master copy, part of the default allow-set
pub const KNOWN_MASTER_COPY: &str = "0xb6029EA3B2c51D09a50B53CA8012FeEB05bDa35A";

pub fn address(raw: &str) -> Address {
    raw.parse().expect("valid test address")
}

/// Settings with short timings and both keys configured
pub fn settings() -> Settings {
    let toml = format!(
        r#"
        [relayer]
        poll_interval_ms = 10
        max_send_retries = 2
        retry_delay_ms = 1
        retry_max_delay_ms = 2
        confirmations = 3
        max_reorg_retries = 2

        [node]
        rpc_urls = ["http://localhost:8545"]
        chain_id = 1337

        [gas_station]
        fixed_gas_price = 1000000000

        [funding]
        check_deployer_funded_delay_secs = 0
        check_deployer_funded_retries = 2

        [wallet]
        funder_private_key = "{}"
        tx_sender_private_key = "{}"
        "#,
        FUNDER_KEY, SENDER_KEY
    );
    Settings::from_toml_str(&toml).expect("valid test settings")
}

/// `settings()` with the gas station sampling the last three blocks
pub fn sampled_settings() -> Settings {
    let mut settings = settings();
    settings.gas_station.fixed_gas_price = None;
    settings.gas_station.number_blocks = 3;
    settings
}

#[derive(Default)]
struct FakeState {
    head: u64,
    default_balance: U256,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    storage: HashMap<Address, H256>,
    receipts: HashMap<H256, ReceiptInfo>,
    block_gas_prices: Vec<U256>,
    send_errors: VecDeque<String>,
    /// Sends the node accepts but whose response never arrives
    lost_send_responses: u32,
    /// Calls that fail once each before the node answers again, by method
    flaky_calls: HashMap<&'static str, u32>,
    sent: Vec<H256>,
    node_down: bool,
}

/// In-memory node
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<FakeState>,
}

impl FakeChain {
    /// A node where every account holds 100 ETH
    pub fn new() -> Self {
        let chain = Self::default();
        chain.with(|s| s.default_balance = U256::exp10(20));
        chain
    }

    fn with<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().expect("fake chain lock");
        f(&mut state)
    }

    pub fn set_head(&self, head: u64) {
        self.with(|s| s.head = head);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.with(|s| {
            s.balances.insert(address, balance);
        });
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.with(|s| {
            s.nonces.insert(address, nonce);
        });
    }

    pub fn set_block_gas_prices(&self, prices: Vec<U256>) {
        self.with(|s| s.block_gas_prices = prices);
    }

    /// Make `safe` look like a proxy of `master_copy`
    pub fn deploy_proxy(&self, safe: Address, master_copy: Address) {
        let mut slot = [0u8; 32];
        slot[12..].copy_from_slice(master_copy.as_bytes());
        self.with(|s| {
            s.storage.insert(safe, H256::from(slot));
        });
    }

    pub fn fail_next_send(&self, message: &str) {
        self.with(|s| s.send_errors.push_back(message.to_string()));
    }

    pub fn set_node_down(&self, down: bool) {
        self.with(|s| s.node_down = down);
    }

    /// Fail the next `times` calls of `method` with a connection reset
    pub fn fail_next_calls(&self, method: &'static str, times: u32) {
        self.with(|s| {
            s.flaky_calls.insert(method, times);
        });
    }

    /// Accept the next `times` sends but lose the node's answer
    pub fn lose_send_responses(&self, times: u32) {
        self.with(|s| s.lost_send_responses = times);
    }

    /// Include `tx_hash` in `block`
    pub fn mine(&self, tx_hash: H256, block: u64) {
        self.mine_with_status(tx_hash, block, true);
    }

    pub fn mine_with_status(&self, tx_hash: H256, block: u64, success: bool) {
        self.with(|s| {
            s.receipts.insert(
                tx_hash,
                ReceiptInfo {
                    block_number: block,
                    block_hash: H256::from_low_u64_be(block),
                    success,
                },
            );
        });
    }

    /// Drop `tx_hash` from the chain as a reorg would
    pub fn evict(&self, tx_hash: H256) {
        self.with(|s| {
            s.receipts.remove(&tx_hash);
        });
    }

    pub fn sent(&self) -> Vec<H256> {
        self.with(|s| s.sent.clone())
    }

    fn check_up(state: &mut FakeState, method: &'static str) -> RelayerResult<()> {
        if state.node_down {
            return Err(RelayerError::ChainConnection {
                message: "connection refused".to_string(),
            });
        }
        if let Some(remaining) = state.flaky_calls.get_mut(method).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(RelayerError::ChainConnection {
                message: "connection reset".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn block_number(&self) -> RelayerResult<u64> {
        self.with(|s| {
            Self::check_up(s, "block_number")?;
            Ok(s.head)
        })
    }

    async fn block_gas_prices(&self, _block_number: u64) -> RelayerResult<Vec<U256>> {
        self.with(|s| {
            Self::check_up(s, "block_gas_prices")?;
            Ok(s.block_gas_prices.clone())
        })
    }

    async fn node_gas_price(&self) -> RelayerResult<U256> {
        self.with(|s| {
            Self::check_up(s, "node_gas_price")?;
            Ok(U256::exp10(9))
        })
    }

    async fn balance(&self, address: Address) -> RelayerResult<U256> {
        self.with(|s| {
            Self::check_up(s, "balance")?;
            Ok(s.balances.get(&address).copied().unwrap_or(s.default_balance))
        })
    }

    async fn pending_nonce(&self, address: Address) -> RelayerResult<u64> {
        self.with(|s| {
            Self::check_up(s, "pending_nonce")?;
            Ok(s.nonces.get(&address).copied().unwrap_or(0))
        })
    }

    async fn storage_at(&self, address: Address, _slot: H256) -> RelayerResult<H256> {
        self.with(|s| {
            Self::check_up(s, "storage_at")?;
            Ok(s.storage.get(&address).copied().unwrap_or_default())
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        self.with(|s| {
            Self::check_up(s, "send_raw_transaction")?;
            if let Some(message) = s.send_errors.pop_front() {
                return Err(RelayerError::Transaction(message));
            }
            let tx_hash = H256::from(keccak256(&raw));
            s.sent.push(tx_hash);
            if s.lost_send_responses > 0 {
                s.lost_send_responses -= 1;
                return Err(RelayerError::ChainConnection {
                    message: "connection reset by peer".to_string(),
                });
            }
            Ok(tx_hash)
        })
    }

    async fn has_transaction(&self, tx_hash: H256) -> RelayerResult<bool> {
        self.with(|s| {
            Self::check_up(s, "has_transaction")?;
            Ok(s.sent.contains(&tx_hash) || s.receipts.contains_key(&tx_hash))
        })
    }

    async fn receipt(&self, tx_hash: H256) -> RelayerResult<Option<ReceiptInfo>> {
        self.with(|s| {
            Self::check_up(s, "receipt")?;
            Ok(s.receipts.get(&tx_hash).cloned())
        })
    }
}

/// Keeps the kinds of raised alerts in memory
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<String>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.alerts
            .lock()
            .expect("alert sink lock")
            .iter()
            .filter(|k| k.as_str() == kind)
            .count()
    }
}

impl AlertSink for RecordingAlertSink {
    fn raise(&self, alert: &RelayerError) {
        self.alerts
            .lock()
            .expect("alert sink lock")
            .push(alert.kind().to_string());
    }
}
