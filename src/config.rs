//! Configuration management for the Safe Relayer
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every component receives the section it needs at construction; nothing here
//! is global.

use crate::retry::BackoffPolicy;

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use ethers::utils::parse_ether;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroize;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub relayer: RelayerConfig,
    pub node: NodeConfig,
    #[serde(default)]
    pub gas_station: GasStationConfig,
    #[serde(default)]
    pub funding: FundingConfig,
    #[serde(default)]
    pub safe: SafeConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayerConfig {
    pub instance_id: String,
    /// Confirmation polling interval
    pub poll_interval_ms: u64,
    pub stale_check_interval_secs: u64,
    pub balance_check_interval_secs: u64,
    pub max_send_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub send_timeout_secs: u64,
    /// Blocks on top of the inclusion block (inclusive) before a relay is confirmed
    pub confirmations: u64,
    pub max_reorg_retries: u32,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            instance_id: "safe-relayer".to_string(),
            poll_interval_ms: 1_000,
            stale_check_interval_secs: 30,
            balance_check_interval_secs: 300,
            max_send_retries: 3,
            retry_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            retry_backoff_multiplier: 2.0,
            send_timeout_secs: 30,
            confirmations: 3,
            max_reorg_retries: 3,
        }
    }
}

impl RelayerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Backoff between send attempts
    pub fn retry_policy(&self) -> BackoffPolicy {
        let base_delay = Duration::from_millis(self.retry_delay_ms);
        BackoffPolicy::new(
            base_delay,
            Duration::from_millis(self.retry_max_delay_ms).max(base_delay),
            self.retry_backoff_multiplier,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
}

/// Which percentile of the sampled window is used for relays
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GasSpeed {
    SafeLow,
    Standard,
    #[default]
    Fast,
    Fastest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasStationConfig {
    pub number_blocks: u64,
    /// Fixed gas price in wei; sampling is skipped when set
    #[serde(deserialize_with = "optional_u64")]
    pub fixed_gas_price: Option<u64>,
    pub speed: GasSpeed,
    pub fetch_concurrency: usize,
    pub cache_ttl_secs: u64,
    pub refresh_interval_secs: u64,
}

impl Default for GasStationConfig {
    fn default() -> Self {
        Self {
            number_blocks: 300,
            fixed_gas_price: None,
            speed: GasSpeed::Fast,
            fetch_concurrency: 16,
            cache_ttl_secs: 60,
            refresh_interval_secs: 30,
        }
    }
}

impl GasStationConfig {
    /// Background refresh period, kept below the cache TTL so callers do not
    /// find the cache expired
    pub fn refresh_interval(&self) -> Duration {
        let ttl = self.cache_ttl_secs.max(1);
        let secs = if self.refresh_interval_secs >= ttl {
            ttl / 2
        } else {
            self.refresh_interval_secs
        };
        Duration::from_secs(secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FundingConfig {
    pub check_deployer_funded_delay_secs: u64,
    pub check_deployer_funded_retries: u32,
    pub backoff_multiplier: f64,
    pub max_delay_secs: u64,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            check_deployer_funded_delay_secs: 30,
            check_deployer_funded_retries: 10,
            backoff_multiplier: 1.0,
            max_delay_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafeConfig {
    /// Master copy of the current Safe contract
    pub contract_address: String,
    pub v1_0_0_contract_address: String,
    pub v0_0_1_contract_address: String,
    pub valid_contract_addresses: Vec<String>,
    pub proxy_factory_address: String,
    pub proxy_factory_v1_0_0_address: String,
    pub default_callback_handler: String,
    /// Maximum ether for a single transaction
    pub funder_max_eth: f64,
}

impl Default for SafeConfig {
    fn default() -> Self {
        Self {
            contract_address: format!("0x{}1", "0".repeat(39)),
            v1_0_0_contract_address: "0xb6029EA3B2c51D09a50B53CA8012FeEB05bDa35A".to_string(),
            v0_0_1_contract_address: "0x8942595A2dC5181Df0465AF0D7be08c8f23C93af".to_string(),
            valid_contract_addresses: vec![
                "0xaE32496491b53841efb51829d6f886387708F99B".to_string(),
                "0xb6029EA3B2c51D09a50B53CA8012FeEB05bDa35A".to_string(),
                "0x8942595A2dC5181Df0465AF0D7be08c8f23C93af".to_string(),
                "0xAC6072986E985aaBE7804695EC2d8970Cf7541A2".to_string(),
            ],
            proxy_factory_address: format!("0x{}2", "0".repeat(39)),
            proxy_factory_v1_0_0_address: "0x12302fE9c02ff50939BaAaaf415fc226C078613C"
                .to_string(),
            default_callback_handler: "0xd5D82B6aDDc9027B22dCA772Aa68D5d74cdBdF44".to_string(),
            funder_max_eth: 0.1,
        }
    }
}

impl SafeConfig {
    /// Master copies a relay may target
    pub fn allowed_contracts(&self) -> Result<HashSet<Address>> {
        let mut allowed = HashSet::new();
        for raw in self
            .valid_contract_addresses
            .iter()
            .chain([
                &self.contract_address,
                &self.v1_0_0_contract_address,
                &self.v0_0_1_contract_address,
            ])
        {
            allowed.insert(parse_address("safe contract", raw)?);
        }
        Ok(allowed)
    }

    pub fn proxy_factory(&self) -> Result<Address> {
        parse_address("proxy factory", &self.proxy_factory_address)
    }

    pub fn proxy_factory_v1_0_0(&self) -> Result<Address> {
        parse_address("v1.0.0 proxy factory", &self.proxy_factory_v1_0_0_address)
    }

    pub fn v1_0_0_contract(&self) -> Result<Address> {
        parse_address("v1.0.0 safe contract", &self.v1_0_0_contract_address)
    }

    pub fn callback_handler(&self) -> Result<Address> {
        parse_address("default callback handler", &self.default_callback_handler)
    }

    /// Per-transaction value cap in wei
    pub fn funder_max_wei(&self) -> Result<U256> {
        parse_ether(self.funder_max_eth)
            .with_context(|| format!("Invalid funder_max_eth: {}", self.funder_max_eth))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub funder_private_key: SecretString,
    #[serde(default)]
    pub tx_sender_private_key: Option<SecretString>,
}

impl WalletConfig {
    /// Key used for Safe execution; falls back to the funder key
    pub fn tx_sender_key(&self) -> &SecretString {
        self.tx_sender_private_key
            .as_ref()
            .filter(|key| !key.is_empty())
            .unwrap_or(&self.funder_private_key)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub tx_not_mined_alert_minutes: u64,
    pub accounts_balance_warning_wei: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            tx_not_mined_alert_minutes: 10,
            accounts_balance_warning_wei: 200_000_000_000_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Private key material. Never printed, wiped on drop.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        self.0.trim_start_matches("0x")
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SAFE_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse settings from TOML text after substituting environment variables
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.node.rpc_urls.iter().all(|url| url.trim().is_empty()) {
            anyhow::bail!("No node RPC URLs configured");
        }

        if self.wallet.funder_private_key.is_empty() {
            anyhow::bail!("Funder private key is not configured");
        }

        if self.gas_station.fixed_gas_price.is_none() && self.gas_station.number_blocks == 0 {
            anyhow::bail!("gas_station.number_blocks must be positive");
        }

        if self.relayer.confirmations == 0 {
            anyhow::bail!("relayer.confirmations must be positive");
        }

        self.safe.allowed_contracts()?;
        self.safe.proxy_factory()?;
        self.safe.proxy_factory_v1_0_0()?;
        self.safe.callback_handler()?;
        self.safe.funder_max_wei()?;

        if self.relayer.confirmations < 3 {
            tracing::warn!(
                "relayer.confirmations is {}, at least 3 is recommended",
                self.relayer.confirmations
            );
        }

        Ok(())
    }
}

fn parse_address(what: &str, raw: &str) -> Result<Address> {
    raw.trim()
        .parse::<Address>()
        .with_context(|| format!("Invalid {} address: {}", what, raw))
}

/// Accepts an integer, a numeric string, or an empty string (None). Empty
/// strings come from unset `${VAR}` placeholders.
fn optional_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(value)) => Ok(Some(value)),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

lazy_static! {
    static ref ENV_VAR: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
