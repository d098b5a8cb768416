//! Safe Relayer - transaction relay core for Gnosis Safe style smart accounts
//!
//! The relayer prices gas from recent block history, checks that its signing
//! keys are funded, signs Safe creation, Safe execution and funding
//! transactions, broadcasts them with per-key nonce discipline and follows
//! them to a configurable confirmation depth.

pub mod alerts;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod metrics;
pub mod relay;
pub mod retry;
pub mod shutdown;
pub mod tx;

#[cfg(test)]
mod test_utils;

pub use config::Settings;
pub use error::{RelayerError, RelayerResult};
pub use relay::{RelayEngine, RelayHandle, RelayRequest, RelayState, TxRelayRecord};
