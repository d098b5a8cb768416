//! Balance checks gating transaction issue

use crate::alerts::AlertSink;
use crate::chain::ChainClient;
use crate::config::{AlertsConfig, FundingConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::retry::{sleep_or_cancel, BackoffPolicy};
use crate::shutdown::Shutdown;

use ethers::types::{Address, U256};
use ethers::utils::format_ether;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingCheckResult {
    pub address: Address,
    pub required: U256,
    pub observed: U256,
    pub retries_remaining: u32,
}

pub struct FundingChecker {
    client: Arc<dyn ChainClient>,
    retries: u32,
    policy: BackoffPolicy,
    balance_warning: U256,
    alerts: Arc<dyn AlertSink>,
}

impl FundingChecker {
    pub fn new(
        client: Arc<dyn ChainClient>,
        funding: &FundingConfig,
        alerts_config: &AlertsConfig,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let base_delay = Duration::from_secs(funding.check_deployer_funded_delay_secs);
        let max_delay = Duration::from_secs(funding.max_delay_secs).max(base_delay);

        Self {
            client,
            retries: funding.check_deployer_funded_retries,
            policy: BackoffPolicy::new(base_delay, max_delay, funding.backoff_multiplier),
            balance_warning: U256::from(alerts_config.accounts_balance_warning_wei),
            alerts,
        }
    }

    /// Poll until `address` holds at least `required`. At most `1 + retries`
    /// balance reads are made; read failures use up a retry like a short balance.
    pub async fn wait_until_funded(
        &self,
        address: Address,
        required: U256,
        shutdown: &Shutdown,
    ) -> RelayerResult<FundingCheckResult> {
        let mut result = FundingCheckResult {
            address,
            required,
            observed: U256::zero(),
            retries_remaining: self.retries,
        };
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.client.balance(address).await {
                Ok(balance) => {
                    result.observed = balance;
                    if balance >= required {
                        debug!(
                            "{:?} funded with {} (need {}) after {} checks",
                            address, balance, required, attempt
                        );
                        crate::metrics::record_funding_check(true);
                        return Ok(result);
                    }
                    debug!(
                        "{:?} has {}, needs {} ({} retries left)",
                        address, balance, required, result.retries_remaining
                    );
                }
                Err(e) => {
                    warn!("Balance check for {:?} failed: {}", address, e);
                }
            }

            if result.retries_remaining == 0 {
                break;
            }
            result.retries_remaining -= 1;

            let delay = self.policy.delay_for(attempt);
            if !sleep_or_cancel(delay, shutdown).await {
                return Err(RelayerError::Cancelled(format!(
                    "funding check for {:?}",
                    address
                )));
            }
        }

        crate::metrics::record_funding_check(false);
        Err(RelayerError::InsufficientFunds {
            address,
            required,
            observed: result.observed,
            attempts: attempt,
        })
    }

    /// Compare sender balances against the warning level. Returns the
    /// addresses that are below it.
    pub async fn check_balance_warnings(&self, addresses: &[Address]) -> Vec<Address> {
        let balances = join_all(addresses.iter().map(|address| {
            let client = self.client.clone();
            let address = *address;
            async move { (address, client.balance(address).await) }
        }))
        .await;

        let mut low = Vec::new();
        for (address, balance) in balances {
            match balance {
                Ok(balance) => {
                    let balance_eth = format_ether(balance).parse::<f64>().unwrap_or(f64::MAX);
                    crate::metrics::record_wallet_balance(address, balance_eth);

                    if balance < self.balance_warning {
                        self.alerts.raise(&RelayerError::LowBalance {
                            address,
                            balance,
                            threshold: self.balance_warning,
                        });
                        low.push(address);
                    } else {
                        info!("Balance of {:?}: {} ETH", address, balance_eth);
                    }
                }
                Err(e) => warn!("Balance check for {:?} failed: {}", address, e),
            }
        }
        low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::test_utils::RecordingAlertSink;

    fn checker(client: MockChainClient, retries: u32, delay_secs: u64) -> FundingChecker {
        checker_with_sink(client, retries, delay_secs, Arc::new(RecordingAlertSink::new()))
    }

    fn checker_with_sink(
        client: MockChainClient,
        retries: u32,
        delay_secs: u64,
        sink: Arc<RecordingAlertSink>,
    ) -> FundingChecker {
        let funding = FundingConfig {
            check_deployer_funded_delay_secs: delay_secs,
            check_deployer_funded_retries: retries,
            ..FundingConfig::default()
        };
        FundingChecker::new(Arc::new(client), &funding, &AlertsConfig::default(), sink)
    }

    #[tokio::test]
    async fn test_never_exceeds_retry_count() {
        for retries in [0u32, 1, 3] {
            let mut client = MockChainClient::new();
            client
                .expect_balance()
                .times(retries as usize + 1)
                .returning(|_| Ok(U256::from(1)));

            let result = checker(client, retries, 0)
                .wait_until_funded(Address::repeat_byte(1), U256::from(10), &Shutdown::never())
                .await;

            match result {
                Err(RelayerError::InsufficientFunds {
                    attempts, observed, ..
                }) => {
                    assert_eq!(attempts, retries + 1);
                    assert_eq!(observed, U256::from(1));
                }
                other => panic!("expected InsufficientFunds, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_funded_after_retries() {
        let mut client = MockChainClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_balance()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(U256::zero()));
        client
            .expect_balance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(U256::from(100)));

        let result = checker(client, 10, 0)
            .wait_until_funded(Address::repeat_byte(1), U256::from(100), &Shutdown::never())
            .await
            .unwrap();

        assert_eq!(result.observed, U256::from(100));
        assert_eq!(result.retries_remaining, 8);
    }

    #[tokio::test]
    async fn test_read_errors_use_up_retries() {
        let mut client = MockChainClient::new();
        client.expect_balance().times(3).returning(|_| {
            Err(RelayerError::ChainConnection {
                message: "timeout".to_string(),
            })
        });

        let result = checker(client, 2, 0)
            .wait_until_funded(Address::repeat_byte(1), U256::one(), &Shutdown::never())
            .await;
        assert!(matches!(result, Err(RelayerError::InsufficientFunds { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting() {
        let mut client = MockChainClient::new();
        client.expect_balance().times(1).returning(|_| Ok(U256::zero()));

        let (trigger, token) = crate::shutdown::channel();
        trigger.trigger();

        let result = checker(client, 10, 60)
            .wait_until_funded(Address::repeat_byte(1), U256::one(), &token)
            .await;
        assert!(matches!(result, Err(RelayerError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_balance_warning_alerts() {
        let rich = Address::repeat_byte(1);
        let poor = Address::repeat_byte(2);

        let mut client = MockChainClient::new();
        client.expect_balance().returning(move |address| {
            if address == poor {
                Ok(U256::from(1_000))
            } else {
                Ok(U256::exp10(18))
            }
        });

        let sink = Arc::new(RecordingAlertSink::new());
        let checker = checker_with_sink(client, 0, 0, sink.clone());

        let low = checker.check_balance_warnings(&[rich, poor]).await;
        assert_eq!(low, vec![poor]);
        assert_eq!(sink.count("low_balance"), 1);
    }
}
