//! Relay engine - composes the relay pipeline and owns the background loops
//!
//! A request flows through:
//! 1. Validation against the contract allow-set and value cap
//! 2. Gas price resolution
//! 3. Funding check on the signing key
//! 4. Nonce lease, signing and broadcast
//! 5. Confirmation tracking, driven by `run`

use super::dispatcher::RelayDispatcher;
use super::record::{RelayHandle, RelayRequest, TxRelayRecord};
use super::store::{RelayStats, RelayStore};
use crate::alerts::AlertSink;
use crate::chain::{ChainClient, ConfirmationTracker};
use crate::config::Settings;
use crate::error::RelayerResult;
use crate::retry::{execute_with_retry, BackoffPolicy};
use crate::shutdown::Shutdown;
use crate::tx::{FundingChecker, GasPriceOracle, NonceManager, TransactionBuilder};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Terminal records kept for status queries
const KEEP_TERMINAL_RECORDS: usize = 10_000;

/// Gas price lookups attempted per submission
const GAS_PRICE_ATTEMPTS: u32 = 3;

pub struct RelayEngine {
    oracle: GasPriceOracle,
    funding: FundingChecker,
    builder: TransactionBuilder,
    dispatcher: RelayDispatcher,
    tracker: ConfirmationTracker,
    store: Arc<RelayStore>,
    alerts: Arc<dyn AlertSink>,
    policy: BackoffPolicy,
    /// Attempts for node reads made on the submission path
    node_attempts: u32,
    shutdown: Shutdown,
    poll_interval: Duration,
    stale_check_interval: Duration,
    balance_check_interval: Duration,
    gas_refresh_interval: Option<Duration>,
}

impl RelayEngine {
    pub fn new(
        client: Arc<dyn ChainClient>,
        settings: &Settings,
        alerts: Arc<dyn AlertSink>,
        shutdown: Shutdown,
    ) -> RelayerResult<Self> {
        let store = Arc::new(RelayStore::new());
        let nonces = Arc::new(NonceManager::new(client.clone()));
        let relayer = &settings.relayer;

        let builder = TransactionBuilder::new(client.clone(), settings)?;
        let oracle = GasPriceOracle::new(client.clone(), settings.gas_station.clone());
        let funding = FundingChecker::new(
            client.clone(),
            &settings.funding,
            &settings.alerts,
            alerts.clone(),
        );
        let dispatcher = RelayDispatcher::new(
            client.clone(),
            nonces.clone(),
            store.clone(),
            alerts.clone(),
            relayer,
            &settings.alerts,
        );
        let tracker = ConfirmationTracker::new(
            client,
            store.clone(),
            nonces,
            alerts.clone(),
            relayer.confirmations,
            relayer.max_reorg_retries,
            relayer.poll_interval(),
        );

        // A fixed price needs no refreshing
        let gas_refresh_interval = settings
            .gas_station
            .fixed_gas_price
            .is_none()
            .then(|| settings.gas_station.refresh_interval());

        Ok(Self {
            oracle,
            funding,
            builder,
            dispatcher,
            tracker,
            store,
            alerts,
            policy: relayer.retry_policy(),
            node_attempts: relayer.max_send_retries + 1,
            shutdown,
            poll_interval: relayer.poll_interval(),
            stale_check_interval: Duration::from_secs(relayer.stale_check_interval_secs.max(1)),
            balance_check_interval: Duration::from_secs(
                relayer.balance_check_interval_secs.max(1),
            ),
            gas_refresh_interval,
        })
    }

    /// Validate, price, fund-check and broadcast a relay. Funds and contract
    /// version errors are returned to the caller as they are.
    pub async fn submit_relay(&self, request: RelayRequest) -> RelayerResult<RelayHandle> {
        let kind = request.kind.label();
        let result = self.try_submit(request).await;

        if let Err(e) = &result {
            warn!("Relay request ({}) rejected: {}", kind, e);
            crate::metrics::record_relay_failed(e.kind());
            if e.should_alert() {
                self.alerts.raise(e);
            }
        }
        result
    }

    async fn try_submit(&self, request: RelayRequest) -> RelayerResult<RelayHandle> {
        // Only the node read inside validation can fail transiently
        execute_with_retry(
            |_| self.builder.validate(&request),
            &self.policy,
            self.node_attempts,
            &self.shutdown,
            "validate relay",
        )
        .await?;

        let gas_price = execute_with_retry(
            |_| self.oracle.gas_price(),
            &self.policy,
            GAS_PRICE_ATTEMPTS,
            &self.shutdown,
            "resolve gas price",
        )
        .await?;

        let signer = self.builder.signer_for(&request.kind);
        let required = request.max_cost(gas_price);
        let funded = self
            .funding
            .wait_until_funded(signer, required, &self.shutdown)
            .await?;
        debug!(
            "Signer {:?} funded: {} available for {} required",
            signer, funded.observed, funded.required
        );

        self.dispatcher
            .dispatch(request, gas_price, &self.builder, &self.shutdown)
            .await
    }

    /// Snapshot of a submitted relay
    pub fn get_status(&self, handle: &RelayHandle) -> RelayerResult<TxRelayRecord> {
        self.store.get(handle)
    }

    /// Block until the relay is confirmed or failed
    pub async fn wait_for_confirmation(
        &self,
        handle: RelayHandle,
    ) -> RelayerResult<TxRelayRecord> {
        self.tracker
            .wait_for_confirmation(handle, &self.shutdown)
            .await
    }

    pub fn stats(&self) -> RelayStats {
        self.store.stats()
    }

    /// Run the background loops until shutdown
    pub async fn run(&self) {
        info!(
            "Relay engine running: {} confirmations, polling every {:?}",
            self.tracker.required_confirmations(),
            self.poll_interval
        );

        let mut confirm_tick = interval(self.poll_interval);
        let mut stale_tick = interval(self.stale_check_interval);
        let mut balance_tick = interval(self.balance_check_interval);
        let mut gas_tick = interval(
            self.gas_refresh_interval
                .unwrap_or(Duration::from_secs(3600)),
        );
        for tick in [
            &mut confirm_tick,
            &mut stale_tick,
            &mut balance_tick,
            &mut gas_tick,
        ] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = confirm_tick.tick() => {
                    if let Err(e) = self.tracker.poll_once().await {
                        warn!("Confirmation poll failed: {}", e);
                    }
                    self.store.prune_terminal(KEEP_TERMINAL_RECORDS);
                }
                _ = stale_tick.tick() => {
                    let flagged = self.dispatcher.check_stale(Utc::now());
                    if !flagged.is_empty() {
                        warn!("{} relays not mined in time", flagged.len());
                    }
                }
                _ = balance_tick.tick() => {
                    self.funding
                        .check_balance_warnings(&self.builder.signer_addresses())
                        .await;
                }
                _ = gas_tick.tick(), if self.gas_refresh_interval.is_some() => {
                    if let Err(e) = self.oracle.refresh().await {
                        warn!("Gas station refresh failed: {}", e);
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            "Relay engine stopped: {} pending, {} stale, {} mined, {} confirmed, {} failed",
            stats.pending, stats.stale, stats.mined, stats.confirmed, stats.failed
        );
    }
}
