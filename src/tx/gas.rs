//! Gas station: fixed price or percentiles over recent block history

use crate::chain::ChainClient;
use crate::config::{GasSpeed, GasStationConfig};
use crate::error::{RelayerError, RelayerResult};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One observed transaction price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPriceSample {
    pub block_number: u64,
    pub price: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GasPriceEstimate {
    pub safe_low: U256,
    pub standard: U256,
    pub fast: U256,
    pub fastest: U256,
    pub last_block: u64,
    pub sampled_at: DateTime<Utc>,
}

impl GasPriceEstimate {
    pub fn for_speed(&self, speed: GasSpeed) -> U256 {
        match speed {
            GasSpeed::SafeLow => self.safe_low,
            GasSpeed::Standard => self.standard,
            GasSpeed::Fast => self.fast,
            GasSpeed::Fastest => self.fastest,
        }
    }

    fn flat(price: U256, last_block: u64) -> Self {
        Self {
            safe_low: price,
            standard: price,
            fast: price,
            fastest: price,
            last_block,
            sampled_at: Utc::now(),
        }
    }
}

struct CachedEstimate {
    estimate: GasPriceEstimate,
    refreshed_at: Instant,
}

/// Resolves the gas price used for relays
pub struct GasPriceOracle {
    client: Arc<dyn ChainClient>,
    config: GasStationConfig,
    /// Last known good estimate
    cache: RwLock<Option<CachedEstimate>>,
    /// Held while sampling so concurrent callers share one refresh
    refresh_lock: Mutex<()>,
}

impl GasPriceOracle {
    pub fn new(client: Arc<dyn ChainClient>, config: GasStationConfig) -> Self {
        Self {
            client,
            config,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Gas price for the next relay
    pub async fn gas_price(&self) -> RelayerResult<U256> {
        if let Some(fixed) = self.config.fixed_gas_price {
            return Ok(U256::from(fixed));
        }

        if let Some(price) = self.fresh_price().await {
            return Ok(price);
        }

        let _refreshing = self.refresh_lock.lock().await;
        // Whoever held the lock before us may have refreshed already
        if let Some(price) = self.fresh_price().await {
            return Ok(price);
        }

        match self.sample_and_store().await {
            Ok(estimate) => Ok(estimate.for_speed(self.config.speed)),
            Err(e) => match self.last_known_good().await {
                Some(estimate) => {
                    warn!(
                        "Gas station sampling failed, using estimate from block {}: {}",
                        estimate.last_block, e
                    );
                    Ok(estimate.for_speed(self.config.speed))
                }
                None => Err(e),
            },
        }
    }

    async fn fresh_price(&self) -> Option<U256> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|cached| cached.refreshed_at.elapsed() < ttl)
            .map(|cached| cached.estimate.for_speed(self.config.speed))
    }

    /// Sample the window and replace the cached estimate
    pub async fn refresh(&self) -> RelayerResult<GasPriceEstimate> {
        let _refreshing = self.refresh_lock.lock().await;
        self.sample_and_store().await
    }

    async fn sample_and_store(&self) -> RelayerResult<GasPriceEstimate> {
        let estimate = match self.estimate().await {
            Ok(estimate) => estimate,
            Err(e) => {
                crate::metrics::record_oracle_failure();
                return Err(e);
            }
        };

        *self.cache.write().await = Some(CachedEstimate {
            estimate: estimate.clone(),
            refreshed_at: Instant::now(),
        });
        crate::metrics::record_gas_price(estimate.for_speed(self.config.speed));

        info!(
            "Gas station at block {}: safe_low={} standard={} fast={} fastest={}",
            estimate.last_block,
            estimate.safe_low,
            estimate.standard,
            estimate.fast,
            estimate.fastest
        );
        Ok(estimate)
    }

    pub async fn last_known_good(&self) -> Option<GasPriceEstimate> {
        self.cache.read().await.as_ref().map(|c| c.estimate.clone())
    }

    /// Sample the last `number_blocks` blocks without touching the cache
    pub async fn estimate(&self) -> RelayerResult<GasPriceEstimate> {
        let last_block = self
            .client
            .block_number()
            .await
            .map_err(|e| RelayerError::OracleUnavailable(e.to_string()))?;

        let samples = self.collect_samples(last_block).await?;
        if samples.is_empty() {
            debug!("No transactions in the sampled window, using node gas price");
            let price = self
                .client
                .node_gas_price()
                .await
                .map_err(|e| RelayerError::OracleUnavailable(e.to_string()))?;
            return Ok(GasPriceEstimate::flat(price, last_block));
        }

        let mut prices: Vec<U256> = samples.iter().map(|s| s.price).collect();
        prices.sort_unstable();

        Ok(GasPriceEstimate {
            safe_low: percentile(&prices, 30),
            standard: percentile(&prices, 50),
            fast: percentile(&prices, 75),
            fastest: percentile(&prices, 100),
            last_block,
            sampled_at: Utc::now(),
        })
    }

    /// Fetch blocks concurrently, samples ordered by block number
    async fn collect_samples(&self, last_block: u64) -> RelayerResult<Vec<GasPriceSample>> {
        let window = self.config.number_blocks.min(last_block + 1);
        let first_block = last_block + 1 - window;
        let client = self.client.clone();

        let mut per_block: Vec<(u64, Vec<U256>)> = stream::iter(first_block..=last_block)
            .map(|block_number| {
                let client = client.clone();
                async move {
                    client
                        .block_gas_prices(block_number)
                        .await
                        .map(|prices| (block_number, prices))
                        .map_err(|e| RelayerError::OracleUnavailable(e.to_string()))
                }
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .try_collect()
            .await?;

        per_block.sort_unstable_by_key(|(block_number, _)| *block_number);

        Ok(per_block
            .into_iter()
            .flat_map(|(block_number, prices)| {
                prices
                    .into_iter()
                    .map(move |price| GasPriceSample { block_number, price })
            })
            .collect())
    }
}

/// Nearest-rank percentile over sorted, non-empty prices
fn percentile(sorted: &[U256], pct: usize) -> U256 {
    let rank = (sorted.len() * pct).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}
