//! Gnosis Safe and proxy factory calldata

use crate::config::SafeConfig;
use crate::error::{RelayerError, RelayerResult};

use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::id;

pub const SETUP_SIGNATURE: &str =
    "setup(address[],uint256,address,bytes,address,address,uint256,address)";
pub const CREATE_PROXY_WITH_NONCE_SIGNATURE: &str = "createProxyWithNonce(address,bytes,uint256)";
pub const EXEC_TRANSACTION_SIGNATURE: &str =
    "execTransaction(address,uint256,bytes,uint8,uint256,uint256,uint256,address,address,bytes)";

/// Arguments of `setup`, the initializer run by a freshly created proxy
#[derive(Debug, Clone)]
pub struct SafeSetup {
    pub owners: Vec<Address>,
    pub threshold: U256,
    pub to: Address,
    pub data: Bytes,
    pub fallback_handler: Address,
    pub payment_token: Address,
    pub payment: U256,
    pub payment_receiver: Address,
}

impl SafeSetup {
    /// Plain setup: no module call, no payment
    pub fn new(owners: Vec<Address>, threshold: u64, fallback_handler: Address) -> Self {
        Self {
            owners,
            threshold: U256::from(threshold),
            to: Address::zero(),
            data: Bytes::default(),
            fallback_handler,
            payment_token: Address::zero(),
            payment: U256::zero(),
            payment_receiver: Address::zero(),
        }
    }

    /// Plain setup using the configured default callback handler as the
    /// fallback handler
    pub fn with_default_handler(
        owners: Vec<Address>,
        threshold: u64,
        safe: &SafeConfig,
    ) -> RelayerResult<Self> {
        let handler = safe
            .callback_handler()
            .map_err(|e| RelayerError::Config(e.to_string()))?;
        Ok(Self::new(owners, threshold, handler))
    }

    pub fn encode(&self) -> Bytes {
        with_selector(
            SETUP_SIGNATURE,
            &[
                Token::Array(self.owners.iter().copied().map(Token::Address).collect()),
                Token::Uint(self.threshold),
                Token::Address(self.to),
                Token::Bytes(self.data.to_vec()),
                Token::Address(self.fallback_handler),
                Token::Address(self.payment_token),
                Token::Uint(self.payment),
                Token::Address(self.payment_receiver),
            ],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Call = 0,
    DelegateCall = 1,
}

/// A Safe transaction already signed by the owners
#[derive(Debug, Clone)]
pub struct SafeTransaction {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub operation: Operation,
    pub safe_tx_gas: U256,
    pub base_gas: U256,
    pub gas_price: U256,
    pub gas_token: Address,
    pub refund_receiver: Address,
    pub signatures: Bytes,
}

impl SafeTransaction {
    pub fn encode(&self) -> Bytes {
        with_selector(
            EXEC_TRANSACTION_SIGNATURE,
            &[
                Token::Address(self.to),
                Token::Uint(self.value),
                Token::Bytes(self.data.to_vec()),
                Token::Uint(U256::from(self.operation as u8)),
                Token::Uint(self.safe_tx_gas),
                Token::Uint(self.base_gas),
                Token::Uint(self.gas_price),
                Token::Address(self.gas_token),
                Token::Address(self.refund_receiver),
                Token::Bytes(self.signatures.to_vec()),
            ],
        )
    }
}

/// Proxy factory call deploying a Safe proxy for `master_copy`
pub fn encode_create_proxy_with_nonce(
    master_copy: Address,
    initializer: &Bytes,
    salt_nonce: U256,
) -> Bytes {
    with_selector(
        CREATE_PROXY_WITH_NONCE_SIGNATURE,
        &[
            Token::Address(master_copy),
            Token::Bytes(initializer.to_vec()),
            Token::Uint(salt_nonce),
        ],
    )
}

/// Safe proxies keep their master copy in storage slot 0
pub fn master_copy_from_slot(slot: H256) -> Address {
    Address::from_slice(&slot.as_bytes()[12..])
}

pub fn is_exec_transaction(calldata: &[u8]) -> bool {
    calldata.len() >= 4 && calldata[..4] == id(EXEC_TRANSACTION_SIGNATURE)
}

fn with_selector(signature: &str, tokens: &[Token]) -> Bytes {
    let mut calldata = id(signature).to_vec();
    calldata.extend(abi::encode(tokens));
    Bytes::from(calldata)
}
