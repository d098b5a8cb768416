//! Relay dispatcher with per-key nonce discipline, send retries and
//! stale transaction alerts

use super::record::{RelayHandle, RelayRequest, SignedRelay, TxRelayRecord};
use super::store::RelayStore;
use crate::alerts::AlertSink;
use crate::chain::finality::is_already_known;
use crate::chain::ChainClient;
use crate::config::{AlertsConfig, RelayerConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::shutdown::Shutdown;
use crate::tx::{NonceManager, TransactionBuilder};

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Node messages that are a final verdict on the transaction itself
const REJECTIONS: &[&str] = &[
    "underpriced",
    "intrinsic gas",
    "exceeds block gas limit",
    "invalid sender",
    "fee cap",
    "oversized",
];

/// Submits signed relays and keeps their records
pub struct RelayDispatcher {
    client: Arc<dyn ChainClient>,
    nonces: Arc<NonceManager>,
    store: Arc<RelayStore>,
    alerts: Arc<dyn AlertSink>,
    policy: BackoffPolicy,
    max_send_retries: u32,
    send_timeout: Duration,
    /// Unmined relays older than this are flagged stale
    stale_after_minutes: u64,
}

impl RelayDispatcher {
    pub fn new(
        client: Arc<dyn ChainClient>,
        nonces: Arc<NonceManager>,
        store: Arc<RelayStore>,
        alerts: Arc<dyn AlertSink>,
        relayer: &RelayerConfig,
        alerts_config: &AlertsConfig,
    ) -> Self {
        Self {
            client,
            nonces,
            store,
            alerts,
            policy: relayer.retry_policy(),
            max_send_retries: relayer.max_send_retries,
            send_timeout: relayer.send_timeout(),
            stale_after_minutes: alerts_config.tx_not_mined_alert_minutes,
        }
    }

    /// Sign and broadcast `request`, then record it as pending.
    ///
    /// Without an explicit nonce the signer's key is leased for the whole
    /// sign-and-send, so concurrent dispatches for one key never share a nonce.
    pub async fn dispatch(
        &self,
        request: RelayRequest,
        gas_price: U256,
        builder: &TransactionBuilder,
        shutdown: &Shutdown,
    ) -> RelayerResult<RelayHandle> {
        let signed = match request.nonce {
            Some(nonce) => {
                debug!("Dispatching with explicit nonce {}", nonce);
                let signed = builder.build(&request, nonce, gas_price).await?;
                self.send(&signed, &request, shutdown).await?;
                signed
            }
            None => {
                let signer = builder.signer_for(&request.kind);
                let mut lease = execute_with_retry(
                    |_| self.nonces.lease(signer),
                    &self.policy,
                    self.max_send_retries + 1,
                    shutdown,
                    "lease nonce",
                )
                .await?;

                let signed = match builder.build(&request, lease.nonce(), gas_price).await {
                    Ok(signed) => signed,
                    Err(e) => {
                        lease.release();
                        return Err(e);
                    }
                };

                match self.send(&signed, &request, shutdown).await {
                    Ok(()) => {
                        lease.commit(&format!("{:?}", signed.tx_hash));
                        signed
                    }
                    Err(e) => {
                        if matches!(e, RelayerError::Nonce { .. }) {
                            warn!("Nonce too low for {:?}, syncing with node", signer);
                            if let Err(sync_error) = self.nonces.sync_lease(&mut lease).await {
                                warn!("Nonce sync for {:?} failed: {}", signer, sync_error);
                            }
                        }
                        lease.release();
                        return Err(e);
                    }
                }
            }
        };

        let handle = RelayHandle::new();
        info!(
            "Relay {} sent: tx {:?} from {:?} nonce {} gas price {}",
            handle, signed.tx_hash, signed.signer, signed.nonce, signed.gas_price
        );
        crate::metrics::record_relay_submitted(request.kind.label());
        self.store
            .insert(TxRelayRecord::pending(handle, request, signed));

        Ok(handle)
    }

    /// Broadcast, settling sends whose outcome is unknown. `Ok` means the
    /// node has, or may have, the transaction and its nonce is spent.
    async fn send(
        &self,
        signed: &SignedRelay,
        request: &RelayRequest,
        shutdown: &Shutdown,
    ) -> RelayerResult<()> {
        match self.send_with_retry(signed, request, shutdown).await {
            Ok(_) => Ok(()),
            Err(e) if is_ambiguous(&e) => self.settle_unknown_send(e, signed, shutdown).await,
            Err(e) => Err(e),
        }
    }

    /// A send that timed out or lost its connection may still have reached
    /// the node. The nonce is only given back when the node says it never saw
    /// the transaction.
    async fn settle_unknown_send(
        &self,
        error: RelayerError,
        signed: &SignedRelay,
        shutdown: &Shutdown,
    ) -> RelayerResult<()> {
        let known = execute_with_retry(
            |_| self.client.has_transaction(signed.tx_hash),
            &self.policy,
            self.max_send_retries + 1,
            shutdown,
            "look up sent transaction",
        )
        .await;

        match known {
            Ok(true) => {
                warn!(
                    "Send of {:?} reported \"{}\" but the node has it",
                    signed.tx_hash, error
                );
                Ok(())
            }
            Ok(false) => Err(error),
            Err(lookup_error) => {
                warn!(
                    "Cannot tell whether {:?} reached the node ({}); keeping nonce {} for {:?}",
                    signed.tx_hash, lookup_error, signed.nonce, signed.signer
                );
                Ok(())
            }
        }
    }

    /// Broadcast with timeout and backoff. Only connectivity failures and
    /// timeouts are retried.
    async fn send_with_retry(
        &self,
        signed: &SignedRelay,
        request: &RelayRequest,
        shutdown: &Shutdown,
    ) -> RelayerResult<H256> {
        let tx_hash = execute_with_retry(
            |attempt| async move {
                debug!(
                    "Sending tx {:?} (attempt {}/{})",
                    signed.tx_hash,
                    attempt,
                    self.max_send_retries + 1
                );
                match timeout(
                    self.send_timeout,
                    self.client.send_raw_transaction(signed.raw.clone()),
                )
                .await
                {
                    Ok(Ok(tx_hash)) => Ok(tx_hash),
                    Ok(Err(e)) => self.classify_send_error(e, signed, request).await,
                    Err(_) => Err(RelayerError::Timeout {
                        operation: format!("send transaction {:?}", signed.tx_hash),
                    }),
                }
            },
            &self.policy,
            self.max_send_retries + 1,
            shutdown,
            "send transaction",
        )
        .await?;

        if tx_hash != signed.tx_hash {
            warn!(
                "Node reported hash {:?} for locally signed {:?}",
                tx_hash, signed.tx_hash
            );
        }
        Ok(signed.tx_hash)
    }

    async fn classify_send_error(
        &self,
        error: RelayerError,
        signed: &SignedRelay,
        request: &RelayRequest,
    ) -> RelayerResult<H256> {
        if is_already_known(&error) {
            debug!("Tx {:?} already known to the node", signed.tx_hash);
            return Ok(signed.tx_hash);
        }

        let message = match error {
            RelayerError::Transaction(message) => message,
            other => return Err(other),
        };
        let lowered = message.to_lowercase();

        if lowered.contains("nonce too low") {
            return Err(RelayerError::Nonce {
                address: signed.signer,
                message,
            });
        }

        if lowered.contains("insufficient funds") {
            let observed = self.client.balance(signed.signer).await.unwrap_or_default();
            return Err(RelayerError::InsufficientFunds {
                address: signed.signer,
                required: request.max_cost(signed.gas_price),
                observed,
                attempts: 1,
            });
        }

        if REJECTIONS.iter().any(|r| lowered.contains(r)) {
            return Err(RelayerError::Transaction(message));
        }

        // Anything else is treated as a transport problem
        Err(RelayerError::ChainConnection { message })
    }

    /// Flag unmined relays older than the alert window. Each relay raises
    /// one alert; it stays tracked and may still be mined.
    pub fn check_stale(&self, now: DateTime<Utc>) -> Vec<RelayHandle> {
        let window = chrono::Duration::minutes(self.stale_after_minutes as i64);
        let mut flagged = Vec::new();

        for handle in self.store.active_handles() {
            let result = self.store.update(&handle, |record| {
                if !record.state.is_unmined() || now - record.submitted_at < window {
                    return Ok(None);
                }
                record
                    .mark_stale()
                    .map(|raised| raised.then_some(record.tx_hash))
            });

            match result {
                Ok(Some(tx_hash)) => {
                    self.alerts.raise(&RelayerError::StaleTransaction {
                        tx_hash,
                        minutes: self.stale_after_minutes,
                    });
                    flagged.push(handle);
                }
                Ok(None) => {}
                Err(e) => debug!("Stale check skipped relay {}: {}", handle, e),
            }
        }

        flagged
    }
}

/// Errors after which the node may or may not hold the transaction
fn is_ambiguous(error: &RelayerError) -> bool {
    matches!(
        error,
        RelayerError::ChainConnection { .. }
            | RelayerError::Timeout { .. }
            | RelayerError::Cancelled(_)
    )
}
