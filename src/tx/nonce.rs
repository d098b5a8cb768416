//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking per signing key, seeded from the node
//! - Single-writer discipline: a lease holds the key's lock from allocation
//!   until the transaction is sent or abandoned
//! - Resync after "nonce too low"

use crate::chain::ChainClient;
use crate::error::RelayerResult;

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Per-key nonce state
#[derive(Debug, Default)]
struct KeyNonceState {
    /// Next nonce to use; None until seeded from the node
    current: Option<u64>,
    /// Sent but not yet confirmed: nonce -> tx hash
    pending: BTreeMap<u64, String>,
}

/// Manages nonces for every signing key
pub struct NonceManager {
    client: Arc<dyn ChainClient>,
    state: DashMap<Address, Arc<Mutex<KeyNonceState>>>,
}

/// Exclusive right to send the next transaction for one key
pub struct NonceLease {
    address: Address,
    nonce: u64,
    guard: OwnedMutexGuard<KeyNonceState>,
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// The transaction was accepted by the node; advance the counter
    pub fn commit(mut self, tx_hash: &str) {
        self.guard.current = Some(self.nonce + 1);
        self.guard.pending.insert(self.nonce, tx_hash.to_string());
        debug!("Committed nonce {} for {:?}", self.nonce, self.address);
    }

    /// Sending failed; the nonce is reused by the next lease
    pub fn release(self) {
        debug!("Released nonce {} for {:?}", self.nonce, self.address);
    }
}

impl NonceManager {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self {
            client,
            state: DashMap::new(),
        }
    }

    fn slot(&self, address: Address) -> Arc<Mutex<KeyNonceState>> {
        // Clone the Arc out so the map shard is not held across an await
        self.state
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(KeyNonceState::default())))
            .value()
            .clone()
    }

    /// Wait for exclusive use of `address` and allocate its next nonce
    pub async fn lease(&self, address: Address) -> RelayerResult<NonceLease> {
        let mut guard = self.slot(address).lock_owned().await;

        let nonce = match guard.current {
            Some(nonce) => nonce,
            None => {
                let on_chain = self.client.pending_nonce(address).await?;
                debug!("Seeded nonce for {:?}: {}", address, on_chain);
                guard.current = Some(on_chain);
                on_chain
            }
        };

        Ok(NonceLease {
            address,
            nonce,
            guard,
        })
    }

    /// Resync a leased key with the node, e.g. after "nonce too low"
    pub async fn sync_lease(&self, lease: &mut NonceLease) -> RelayerResult<()> {
        let on_chain = self.client.pending_nonce(lease.address).await?;
        let local = lease.guard.current.unwrap_or(on_chain);

        if on_chain > local {
            warn!(
                "Nonce gap detected for {:?}: local {}, node {}",
                lease.address, local, on_chain
            );
        }

        lease.guard.pending.retain(|nonce, _| *nonce >= on_chain);
        let next = local.max(on_chain);
        lease.guard.current = Some(next);
        lease.nonce = next;
        Ok(())
    }

    /// Drop bookkeeping for a mined nonce
    pub async fn confirm(&self, address: Address, nonce: u64) {
        let slot = self.slot(address);
        let mut state = slot.lock().await;
        state.pending.remove(&nonce);
    }

    pub async fn pending_count(&self, address: Address) -> usize {
        let slot = self.slot(address);
        let state = slot.lock().await;
        state.pending.len()
    }
}
