//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Relay lifecycle (submitted, confirmed, failed, reorg evictions)
//! - Gas station output and failures
//! - Funding checks and signer balances
//! - Alerts by kind

use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::{Address, U256};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Relay metrics
    pub static ref RELAYS_SUBMITTED: CounterVec = register_counter_vec!(
        "safe_relayer_relays_submitted_total",
        "Total relays broadcast to the node",
        &["kind"]
    ).unwrap();

    pub static ref RELAYS_CONFIRMED: CounterVec = register_counter_vec!(
        "safe_relayer_relays_confirmed_total",
        "Total relays that reached the confirmation depth",
        &["kind"]
    ).unwrap();

    pub static ref RELAYS_FAILED: CounterVec = register_counter_vec!(
        "safe_relayer_relays_failed_total",
        "Total relays rejected or failed, by error kind",
        &["reason"]
    ).unwrap();

    pub static ref REORG_EVICTIONS: Counter = register_counter!(
        "safe_relayer_reorg_evictions_total",
        "Mined relays rolled back by a reorg"
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "safe_relayer_confirmation_latency_seconds",
        "Time from submission to confirmation",
        &["kind"],
        vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();

    // Gas station metrics
    pub static ref GAS_PRICE: Gauge = register_gauge!(
        "safe_relayer_gas_price_wei",
        "Gas price currently used for relays"
    ).unwrap();

    pub static ref ORACLE_FAILURES: Counter = register_counter!(
        "safe_relayer_gas_oracle_failures_total",
        "Gas station sampling failures"
    ).unwrap();

    // Funding metrics
    pub static ref FUNDING_CHECKS: CounterVec = register_counter_vec!(
        "safe_relayer_funding_checks_total",
        "Funding checks by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "safe_relayer_wallet_balance_eth",
        "Signer balance in ETH",
        &["address"]
    ).unwrap();

    // Alerts
    pub static ref ALERTS: CounterVec = register_counter_vec!(
        "safe_relayer_alerts_total",
        "Alerts raised by kind",
        &["kind"]
    ).unwrap();

    // Health metrics
    pub static ref NODE_HEALTHY: Gauge = register_gauge!(
        "safe_relayer_node_healthy",
        "Node health (1=healthy, 0=unreachable)"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            RelayerError::Config(format!("Cannot bind metrics port {}: {}", self.port, e))
        })?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server stopped: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

fn u256_to_f64(value: U256) -> f64 {
    if value > U256::from(u128::MAX) {
        return f64::MAX;
    }
    value.as_u128() as f64
}

// Helper functions to record metrics

pub fn record_relay_submitted(kind: &str) {
    RELAYS_SUBMITTED.with_label_values(&[kind]).inc();
}

pub fn record_relay_confirmed(kind: &str, latency_secs: f64) {
    RELAYS_CONFIRMED.with_label_values(&[kind]).inc();
    CONFIRMATION_LATENCY
        .with_label_values(&[kind])
        .observe(latency_secs);
}

pub fn record_relay_failed(reason: &str) {
    RELAYS_FAILED.with_label_values(&[reason]).inc();
}

pub fn record_reorg_eviction() {
    REORG_EVICTIONS.inc();
}

pub fn record_gas_price(price: U256) {
    GAS_PRICE.set(u256_to_f64(price));
}

pub fn record_oracle_failure() {
    ORACLE_FAILURES.inc();
}

pub fn record_funding_check(funded: bool) {
    let outcome = if funded { "funded" } else { "insufficient" };
    FUNDING_CHECKS.with_label_values(&[outcome]).inc();
}

pub fn record_wallet_balance(address: Address, balance_eth: f64) {
    WALLET_BALANCE
        .with_label_values(&[&format!("{:?}", address)])
        .set(balance_eth);
}

pub fn record_alert(kind: &str) {
    ALERTS.with_label_values(&[kind]).inc();
}

pub fn record_node_health(healthy: bool) {
    NODE_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_relay_metrics() {
        record_relay_submitted("safe_funding");
        record_gas_price(U256::exp10(9));

        let text = render().unwrap();
        assert!(text.contains("safe_relayer_relays_submitted_total"));
        assert!(text.contains("safe_relayer_gas_price_wei"));
    }

    #[test]
    fn test_funding_outcome_labels() {
        let before = FUNDING_CHECKS.with_label_values(&["insufficient"]).get();
        record_funding_check(false);
        assert!(FUNDING_CHECKS.with_label_values(&["insufficient"]).get() >= before + 1.0);
    }
}
