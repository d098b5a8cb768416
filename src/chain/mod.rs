//! Chain module - node access and confirmation tracking
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - The `ChainClient` seam the relay core reads the node through
//! - Confirmation depth tracking with reorg rollback

pub mod finality;
pub mod provider;

pub use finality::ConfirmationTracker;
#[cfg(test)]
pub use provider::MockChainClient;
pub use provider::{ChainClient, ChainProvider, ReceiptInfo};
