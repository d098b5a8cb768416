//! Transaction preparation: gas pricing, nonces, funding checks and signing

pub mod builder;
pub mod funding;
pub mod gas;
pub mod nonce;

pub use builder::TransactionBuilder;
pub use funding::{FundingCheckResult, FundingChecker};
pub use gas::{GasPriceEstimate, GasPriceOracle};
pub use nonce::{NonceLease, NonceManager};
