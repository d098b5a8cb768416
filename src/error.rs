//! Error types for the Safe Relayer

use ethers::types::{Address, H256, U256};
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain connection error: {message}")]
    ChainConnection { message: String },

    #[error("Gas price oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error(
        "Insufficient funds for {address:?}: have {observed}, need {required} ({attempts} checks)"
    )]
    InsufficientFunds {
        address: Address,
        required: U256,
        observed: U256,
        attempts: u32,
    },

    #[error("Unknown contract version {address:?}")]
    UnknownContractVersion { address: Address },

    #[error("Transaction {tx_hash:?} not mined after {minutes} minutes")]
    StaleTransaction { tx_hash: H256, minutes: u64 },

    #[error("Transaction {tx_hash:?} evicted by reorg ({evictions} times)")]
    ReorgEviction { tx_hash: H256, evictions: u32 },

    #[error("Balance of {address:?} is {balance}, below warning level {threshold}")]
    LowBalance {
        address: Address,
        balance: U256,
        threshold: U256,
    },

    #[error("Value {value} exceeds per-transaction cap {cap}")]
    ValueCapExceeded { value: U256, cap: U256 },

    #[error("Invalid relay request: {0}")]
    InvalidRequest(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for {address:?}: {message}")]
    Nonce { address: Address, message: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Relay {handle} not found")]
    RelayNotFound { handle: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. }
                | RelayerError::OracleUnavailable(_)
                | RelayerError::Timeout { .. }
                | RelayerError::ReorgEviction { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientFunds { .. }
                | RelayerError::StaleTransaction { .. }
                | RelayerError::ReorgEviction { .. }
                | RelayerError::LowBalance { .. }
                | RelayerError::Wallet(_)
        )
    }

    /// Short label used for metrics and alert routing
    pub fn kind(&self) -> &'static str {
        match self {
            RelayerError::Config(_) => "config",
            RelayerError::ChainConnection { .. } => "chain_connection",
            RelayerError::OracleUnavailable(_) => "oracle_unavailable",
            RelayerError::InsufficientFunds { .. } => "insufficient_funds",
            RelayerError::UnknownContractVersion { .. } => "unknown_contract_version",
            RelayerError::StaleTransaction { .. } => "stale_transaction",
            RelayerError::ReorgEviction { .. } => "reorg_eviction",
            RelayerError::LowBalance { .. } => "low_balance",
            RelayerError::ValueCapExceeded { .. } => "value_cap_exceeded",
            RelayerError::InvalidRequest(_) => "invalid_request",
            RelayerError::Transaction(_) => "transaction",
            RelayerError::Nonce { .. } => "nonce",
            RelayerError::Wallet(_) => "wallet",
            RelayerError::Timeout { .. } => "timeout",
            RelayerError::RelayNotFound { .. } => "relay_not_found",
            RelayerError::InvalidStateTransition { .. } => "invalid_state_transition",
            RelayerError::Cancelled(_) => "cancelled",
            RelayerError::Internal(_) => "internal",
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
