//! Safe Relayer - runs the relay engine background loops and the metrics endpoint

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use safe_relayer::alerts::LogAlertSink;
use safe_relayer::chain::{ChainClient, ChainProvider};
use safe_relayer::config::Settings;
use safe_relayer::metrics::{self, MetricsServer};
use safe_relayer::relay::RelayEngine;
use safe_relayer::shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Safe Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: chain {}, {} RPC endpoints, {} confirmations",
        settings.node.chain_id,
        settings.node.rpc_urls.len(),
        settings.relayer.confirmations
    );

    // Connect to the node
    let provider = Arc::new(ChainProvider::new(&settings.node)?);
    provider
        .verify_chain_id()
        .await
        .context("Node does not serve the configured chain")?;
    info!("Node connection established");

    let (trigger, token) = shutdown::channel();
    let alerts = Arc::new(LogAlertSink::new(settings.relayer.instance_id.clone()));
    let client: Arc<dyn ChainClient> = provider.clone();

    let engine = Arc::new(RelayEngine::new(client, &settings, alerts, token.clone())?);
    info!("Relay engine initialized");

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start relay engine
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run().await }
    });

    // Node health loop
    let health_handle = tokio::spawn({
        let provider = provider.clone();
        let token = token.clone();
        let interval = settings.relayer.balance_check_interval_secs.max(1);
        async move {
            loop {
                if !safe_relayer::retry::sleep_or_cancel(
                    tokio::time::Duration::from_secs(interval),
                    &token,
                )
                .await
                {
                    break;
                }

                let healthy = provider.health_check().await;
                if !healthy {
                    warn!("Node health check failed");
                }
                metrics::record_node_health(healthy);
            }
        }
    });

    info!("Safe Relayer is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    trigger.trigger();
    if let Err(e) = engine_handle.await {
        error!("Relay engine task failed: {}", e);
    }
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    let stats = engine.stats();
    info!(
        "Safe Relayer stopped with {} relays still unconfirmed",
        stats.pending + stats.stale + stats.mined
    );
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,safe_relayer=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
