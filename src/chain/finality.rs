//! Confirmation depth tracking for submitted relays
//!
//! A relay is confirmed once its inclusion block is `confirmations` deep,
//! counting the inclusion block itself. Receipts are re-read on every poll so
//! a reorg that drops the transaction, or moves it to another block, is seen
//! before the record turns terminal.

use crate::alerts::AlertSink;
use crate::chain::{ChainClient, ReceiptInfo};
use crate::error::{RelayerError, RelayerResult};
use crate::relay::record::{RelayHandle, RelayState, TxRelayRecord};
use crate::relay::store::RelayStore;
use crate::shutdown::Shutdown;
use crate::tx::NonceManager;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What one poll changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub mined: usize,
    pub confirmed: usize,
    pub evicted: usize,
    pub failed: usize,
}

/// Tracks confirmations for every active relay
pub struct ConfirmationTracker {
    client: Arc<dyn ChainClient>,
    store: Arc<RelayStore>,
    nonces: Arc<NonceManager>,
    alerts: Arc<dyn AlertSink>,
    /// Required confirmation blocks
    confirmations: u64,
    max_reorg_retries: u32,
    poll_interval: Duration,
    /// One poll at a time; the run loop and waiters share the tracker
    poll_lock: Mutex<()>,
}

impl ConfirmationTracker {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<RelayStore>,
        nonces: Arc<NonceManager>,
        alerts: Arc<dyn AlertSink>,
        confirmations: u64,
        max_reorg_retries: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            nonces,
            alerts,
            confirmations: confirmations.max(1),
            max_reorg_retries,
            poll_interval,
            poll_lock: Mutex::new(()),
        }
    }

    pub fn required_confirmations(&self) -> u64 {
        self.confirmations
    }

    /// Check every active relay once against the current head
    pub async fn poll_once(&self) -> RelayerResult<PollSummary> {
        let _polling = self.poll_lock.lock().await;
        let head = self.client.block_number().await?;
        let mut summary = PollSummary::default();

        for handle in self.store.active_handles() {
            let record = match self.store.get(&handle) {
                Ok(record) => record,
                // Pruned between listing and reading
                Err(_) => continue,
            };

            let receipt = match self.client.receipt(record.tx_hash).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!("Receipt lookup for {:?} failed: {}", record.tx_hash, e);
                    continue;
                }
            };

            if let Err(e) = self.advance(&record, receipt, head, &mut summary).await {
                warn!("Could not advance relay {}: {}", handle, e);
            }
        }

        if summary != PollSummary::default() {
            debug!("Confirmation poll at head {}: {:?}", head, summary);
        }
        Ok(summary)
    }

    async fn advance(
        &self,
        record: &TxRelayRecord,
        receipt: Option<ReceiptInfo>,
        head: u64,
        summary: &mut PollSummary,
    ) -> RelayerResult<()> {
        match (record.state, receipt) {
            (state, None) if state.is_unmined() => Ok(()),
            (state, Some(receipt)) if state.is_unmined() => {
                self.on_included(record, &receipt, head, summary).await
            }
            (RelayState::Mined, None) => self.on_evicted(record, None, summary).await,
            (RelayState::Mined, Some(receipt)) => {
                if record.block_hash != Some(receipt.block_hash) {
                    self.on_evicted(record, Some(receipt), summary).await
                } else {
                    self.check_depth(record, &receipt, head, summary).await
                }
            }
            _ => Ok(()),
        }
    }

    async fn on_included(
        &self,
        record: &TxRelayRecord,
        receipt: &ReceiptInfo,
        head: u64,
        summary: &mut PollSummary,
    ) -> RelayerResult<()> {
        if !receipt.success {
            let reason = format!("reverted in block {}", receipt.block_number);
            self.store
                .update(&record.handle, |r| r.mark_failed(reason.clone()))?;
            // A reverted transaction still consumes its nonce
            self.nonces.confirm(record.signer, record.nonce).await;
            crate::metrics::record_relay_failed("reverted");
            summary.failed += 1;
            warn!("Relay {} tx {:?} {}", record.handle, record.tx_hash, reason);
            return Ok(());
        }

        let marked = self.store.update(&record.handle, |r| {
            if !r.state.is_unmined() {
                return Ok(false);
            }
            r.mark_mined(receipt.block_number, receipt.block_hash)?;
            Ok(true)
        })?;
        if !marked {
            return Ok(());
        }
        summary.mined += 1;
        info!(
            "Relay {} tx {:?} mined in block {}",
            record.handle, record.tx_hash, receipt.block_number
        );

        self.check_depth(record, receipt, head, summary).await
    }

    async fn check_depth(
        &self,
        record: &TxRelayRecord,
        receipt: &ReceiptInfo,
        head: u64,
        summary: &mut PollSummary,
    ) -> RelayerResult<()> {
        let depth = confirmations_at(receipt.block_number, head);
        let required = self.confirmations;

        let confirmed = self.store.update(&record.handle, |r| {
            // Another poll moved the record on since it was read
            if r.state != RelayState::Mined || r.block_hash != Some(receipt.block_hash) {
                return Ok(false);
            }
            r.confirmations = depth;
            if depth >= required {
                r.mark_confirmed(depth)?;
                return Ok(true);
            }
            Ok(false)
        })?;

        if confirmed {
            self.nonces.confirm(record.signer, record.nonce).await;
            let latency = (Utc::now() - record.submitted_at).num_milliseconds() as f64 / 1000.0;
            crate::metrics::record_relay_confirmed(record.request.kind.label(), latency);
            summary.confirmed += 1;
            info!(
                "Relay {} tx {:?} confirmed ({} confirmations)",
                record.handle, record.tx_hash, depth
            );
        } else {
            debug!(
                "Relay {} tx {:?} has {} / {} confirmations",
                record.handle, record.tx_hash, depth, required
            );
        }
        Ok(())
    }

    /// Roll back a mined relay. `moved_to` carries the receipt when the
    /// transaction was re-included in a different block.
    ///
    /// The rollback only applies while the stored record is still mined in
    /// the block `record` saw, so one reorg is counted once.
    async fn on_evicted(
        &self,
        record: &TxRelayRecord,
        moved_to: Option<ReceiptInfo>,
        summary: &mut PollSummary,
    ) -> RelayerResult<()> {
        let max_reorg_retries = self.max_reorg_retries;
        let seen_in = record.block_hash;

        let outcome = self.store.update(&record.handle, |r| {
            if r.state != RelayState::Mined || r.block_hash != seen_in {
                return Ok(None);
            }
            if !r.evict(max_reorg_retries)? {
                return Ok(Some(Eviction::Failed(r.reorg_count)));
            }
            if let Some(receipt) = &moved_to {
                r.mark_mined(receipt.block_number, receipt.block_hash)?;
            }
            Ok(Some(Eviction::RolledBack(r.reorg_count)))
        })?;

        let Some(eviction) = outcome else {
            debug!(
                "Relay {} tx {:?} already handled by another poll",
                record.handle, record.tx_hash
            );
            return Ok(());
        };
        let evictions = match eviction {
            Eviction::RolledBack(evictions) | Eviction::Failed(evictions) => evictions,
        };

        crate::metrics::record_reorg_eviction();
        self.alerts.raise(&RelayerError::ReorgEviction {
            tx_hash: record.tx_hash,
            evictions,
        });
        summary.evicted += 1;

        if matches!(eviction, Eviction::Failed(_)) {
            crate::metrics::record_relay_failed("reorg_eviction");
            summary.failed += 1;
            warn!(
                "Relay {} tx {:?} failed after {} reorg evictions",
                record.handle, record.tx_hash, evictions
            );
            return Ok(());
        }

        match moved_to {
            Some(receipt) => {
                info!(
                    "Relay {} tx {:?} moved to block {} by a reorg",
                    record.handle, record.tx_hash, receipt.block_number
                );
            }
            None => {
                warn!(
                    "Relay {} tx {:?} evicted by a reorg, rebroadcasting",
                    record.handle, record.tx_hash
                );
                self.rebroadcast(record).await;
            }
        }
        Ok(())
    }

    async fn rebroadcast(&self, record: &TxRelayRecord) {
        if let Err(e) = self
            .client
            .send_raw_transaction(record.signed_payload.clone())
            .await
        {
            if !is_already_known(&e) {
                warn!("Rebroadcast of {:?} failed: {}", record.tx_hash, e);
            }
        }
    }

    /// Poll until the relay turns terminal
    pub async fn wait_for_confirmation(
        &self,
        handle: RelayHandle,
        shutdown: &Shutdown,
    ) -> RelayerResult<TxRelayRecord> {
        loop {
            let record = self.store.get(&handle)?;
            if record.state.is_terminal() {
                return Ok(record);
            }

            if let Err(e) = self.poll_once().await {
                warn!("Confirmation poll failed: {}", e);
            }

            let record = self.store.get(&handle)?;
            if record.state.is_terminal() {
                return Ok(record);
            }

            if !crate::retry::sleep_or_cancel(self.poll_interval, shutdown).await {
                return Err(RelayerError::Cancelled(format!(
                    "waiting for relay {}",
                    handle
                )));
            }
        }
    }
}

enum Eviction {
    RolledBack(u32),
    Failed(u32),
}

/// Depth of `block_number` at `head`, counting the inclusion block
pub fn confirmations_at(block_number: u64, head: u64) -> u64 {
    if head < block_number {
        0
    } else {
        head - block_number + 1
    }
}

pub(crate) fn is_already_known(error: &RelayerError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("already known") || message.contains("known transaction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::record::{RelayRequest, SignedRelay};
    use crate::test_utils::{FakeChain, RecordingAlertSink};
    use ethers::types::{Address, Bytes, H256, U256};

    struct Fixture {
        chain: Arc<FakeChain>,
        store: Arc<RelayStore>,
        alerts: Arc<RecordingAlertSink>,
        tracker: ConfirmationTracker,
    }

    fn fixture(max_reorg_retries: u32) -> Fixture {
        let chain = Arc::new(FakeChain::new());
        let store = Arc::new(RelayStore::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let tracker = ConfirmationTracker::new(
            chain.clone(),
            store.clone(),
            Arc::new(NonceManager::new(chain.clone())),
            alerts.clone(),
            3,
            max_reorg_retries,
            Duration::from_millis(5),
        );
        Fixture {
            chain,
            store,
            alerts,
            tracker,
        }
    }

    fn submit(store: &RelayStore, tx_hash: H256) -> RelayHandle {
        let signed = SignedRelay {
            signer: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            nonce: 0,
            gas_price: U256::one(),
            tx_hash,
            raw: Bytes::from(vec![0xc0]),
        };
        let record = TxRelayRecord::pending(
            RelayHandle::new(),
            RelayRequest::safe_funding(Address::repeat_byte(2), U256::one()),
            signed,
        );
        let handle = record.handle;
        store.insert(record);
        handle
    }

    #[test]
    fn test_confirmations_count_inclusion_block() {
        assert_eq!(confirmations_at(100, 99), 0);
        assert_eq!(confirmations_at(100, 100), 1);
        assert_eq!(confirmations_at(100, 102), 3);
    }

    #[tokio::test]
    async fn test_pending_to_confirmed() {
        let f = fixture(2);
        let tx = H256::repeat_byte(0xaa);
        let handle = submit(&f.store, tx);

        f.chain.set_head(100);
        let summary = f.tracker.poll_once().await.unwrap();
        assert_eq!(summary, PollSummary::default());
        assert_eq!(f.store.get(&handle).unwrap().state, RelayState::Pending);

        f.chain.mine(tx, 100);
        f.chain.set_head(101);
        let summary = f.tracker.poll_once().await.unwrap();
        assert_eq!(summary.mined, 1);
        let record = f.store.get(&handle).unwrap();
        assert_eq!(record.state, RelayState::Mined);
        assert_eq!(record.confirmations, 2);

        f.chain.set_head(102);
        let summary = f.tracker.poll_once().await.unwrap();
        assert_eq!(summary.confirmed, 1);
        let record = f.store.get(&handle).unwrap();
        assert_eq!(record.state, RelayState::Confirmed);
        assert_eq!(record.confirmations, 3);
    }

    #[tokio::test]
    async fn test_reverted_receipt_fails() {
        let f = fixture(2);
        let tx = H256::repeat_byte(0xbb);
        let handle = submit(&f.store, tx);

        f.chain.set_head(50);
        f.chain.mine_with_status(tx, 50, false);
        let summary = f.tracker.poll_once().await.unwrap();

        assert_eq!(summary.failed, 1);
        let record = f.store.get(&handle).unwrap();
        assert_eq!(record.state, RelayState::Failed);
        assert!(record.failure.unwrap().contains("reverted"));
    }

    #[tokio::test]
    async fn test_eviction_rebroadcasts_and_alerts() {
        let f = fixture(2);
        let tx = H256::repeat_byte(0xcc);
        let handle = submit(&f.store, tx);

        f.chain.set_head(10);
        f.chain.mine(tx, 10);
        f.tracker.poll_once().await.unwrap();

        f.chain.evict(tx);
        let summary = f.tracker.poll_once().await.unwrap();
        assert_eq!(summary.evicted, 1);

        let record = f.store.get(&handle).unwrap();
        assert_eq!(record.state, RelayState::Pending);
        assert_eq!(record.reorg_count, 1);
        assert_eq!(f.chain.sent().len(), 1);
        assert_eq!(f.alerts.count("reorg_eviction"), 1);
    }

    #[tokio::test]
    async fn test_block_hash_change_is_eviction() {
        let f = fixture(2);
        let tx = H256::repeat_byte(0xdd);
        let handle = submit(&f.store, tx);

        f.chain.set_head(10);
        f.chain.mine(tx, 10);
        f.tracker.poll_once().await.unwrap();

        // Re-included one block later on the new fork
        f.chain.mine(tx, 11);
        f.chain.set_head(11);
        f.tracker.poll_once().await.unwrap();

        let record = f.store.get(&handle).unwrap();
        assert_eq!(record.state, RelayState::Mined);
        assert_eq!(record.block_number, Some(11));
        assert_eq!(record.reorg_count, 1);
        assert!(f.chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_outdated_read_does_not_count_reorg_twice() {
        let f = fixture(2);
        let tx = H256::repeat_byte(0x21);
        let handle = submit(&f.store, tx);

        f.chain.set_head(10);
        f.chain.mine(tx, 10);
        f.tracker.poll_once().await.unwrap();
        let read_at_ten = f.store.get(&handle).unwrap();

        f.chain.mine(tx, 11);
        f.chain.set_head(11);
        f.tracker.poll_once().await.unwrap();

        // A second poll still holding the record as mined in block 10
        let receipt = f.chain.receipt(tx).await.unwrap();
        let mut summary = PollSummary::default();
        f.tracker
            .advance(&read_at_ten, receipt, 11, &mut summary)
            .await
            .unwrap();

        assert_eq!(summary, PollSummary::default());
        let record = f.store.get(&handle).unwrap();
        assert_eq!(record.state, RelayState::Mined);
        assert_eq!(record.block_number, Some(11));
        assert_eq!(record.reorg_count, 1);
        assert_eq!(f.alerts.count("reorg_eviction"), 1);
    }

    #[tokio::test]
    async fn test_outdated_read_does_not_rebroadcast_twice() {
        let f = fixture(2);
        let tx = H256::repeat_byte(0x22);
        let handle = submit(&f.store, tx);

        f.chain.set_head(10);
        f.chain.mine(tx, 10);
        f.tracker.poll_once().await.unwrap();
        let read_at_ten = f.store.get(&handle).unwrap();

        f.chain.evict(tx);
        f.tracker.poll_once().await.unwrap();

        let mut summary = PollSummary::default();
        f.tracker
            .advance(&read_at_ten, None, 10, &mut summary)
            .await
            .unwrap();

        let record = f.store.get(&handle).unwrap();
        assert_eq!(record.state, RelayState::Pending);
        assert_eq!(record.reorg_count, 1);
        assert_eq!(f.chain.sent().len(), 1);
        assert_eq!(f.alerts.count("reorg_eviction"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_polls_count_one_eviction() {
        let f = fixture(2);
        let tx = H256::repeat_byte(0x23);
        let handle = submit(&f.store, tx);

        f.chain.set_head(10);
        f.chain.mine(tx, 10);
        f.tracker.poll_once().await.unwrap();

        f.chain.mine(tx, 12);
        f.chain.set_head(12);
        let (a, b) = tokio::join!(f.tracker.poll_once(), f.tracker.poll_once());

        assert_eq!(a.unwrap().evicted + b.unwrap().evicted, 1);
        assert_eq!(f.store.get(&handle).unwrap().reorg_count, 1);
        assert_eq!(f.alerts.count("reorg_eviction"), 1);
    }

    #[tokio::test]
    async fn test_reorg_budget_exhausted_fails() {
        let f = fixture(1);
        let tx = H256::repeat_byte(0xee);
        let handle = submit(&f.store, tx);
        f.chain.set_head(10);

        for _ in 0..2 {
            f.chain.mine(tx, 10);
            f.tracker.poll_once().await.unwrap();
            f.chain.evict(tx);
            f.tracker.poll_once().await.unwrap();
        }

        let record = f.store.get(&handle).unwrap();
        assert_eq!(record.state, RelayState::Failed);
        assert_eq!(record.reorg_count, 2);
        assert_eq!(f.alerts.count("reorg_eviction"), 2);
    }

    #[tokio::test]
    async fn test_wait_for_confirmation() {
        let f = fixture(2);
        let tx = H256::repeat_byte(0x11);
        let handle = submit(&f.store, tx);
        f.chain.set_head(20);
        f.chain.mine(tx, 18);

        let record = f
            .tracker
            .wait_for_confirmation(handle, &Shutdown::never())
            .await
            .unwrap();
        assert_eq!(record.state, RelayState::Confirmed);
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let f = fixture(2);
        let handle = submit(&f.store, H256::repeat_byte(0x12));
        let (trigger, token) = crate::shutdown::channel();
        trigger.trigger();

        let result = f.tracker.wait_for_confirmation(handle, &token).await;
        assert!(matches!(result, Err(RelayerError::Cancelled(_))));
    }
}
