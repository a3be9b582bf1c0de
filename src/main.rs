//! pledge-sync - off-chain donation ledger synchronizer
//!
//! Hosts the core against its production collaborators: a Postgres record
//! store and an ethers-backed liquid-pledging contract client.

use anyhow::{Context, Result};
use ethers::signers::LocalWallet;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use pledge_sync::config::Settings;
use pledge_sync::ledger::{EthLedgerClient, TransferScanner};
use pledge_sync::metrics::MetricsServer;
use pledge_sync::normalizer::Normalizer;
use pledge_sync::reconciler::PledgeEventReconciler;
use pledge_sync::store::PgStore;
use pledge_sync::tx::TransactionSubmitter;

/// Transfer events buffered between the scanner and the reconciler
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting pledge-sync v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;

    let store = Arc::new(PgStore::new(&settings.database).await?);
    store.run_migrations().await?;
    info!("Database connection established");

    let wallet = load_funding_wallet(&settings)?;
    let ledger = Arc::new(EthLedgerClient::new(settings.ledger.clone(), wallet)?);
    let funding_address = ledger.funding_address();

    let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let scanner = Arc::new(
        TransferScanner::new(
            settings.scanner.clone(),
            ledger.clone(),
            store.clone(),
            event_tx,
        )
        .await?,
    );

    let reconciler = Arc::new(PledgeEventReconciler::new(
        store.clone(),
        ledger.clone(),
        Duration::from_secs(settings.reconciler.retry_delay_secs),
    ));

    let submitter = Arc::new(TransactionSubmitter::new(ledger.clone()));
    let normalizer = Arc::new(Normalizer::new(
        store.clone(),
        ledger.clone(),
        submitter,
        funding_address,
        &settings.normalizer,
    ));

    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let scanner_handle = tokio::spawn({
        let scanner = scanner.clone();
        async move {
            if let Err(e) = scanner.run().await {
                error!("Transfer scanner error: {}", e);
            }
        }
    });

    let reconciler_handle = tokio::spawn(reconciler.run(event_rx));

    let normalizer_handle = tokio::spawn({
        let normalizer = normalizer.clone();
        async move { normalizer.run().await }
    });

    let health_handle = tokio::spawn({
        let store = store.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                if let Err(e) = store.health_check().await {
                    warn!("Database health check failed: {}", e);
                }
            }
        }
    });

    info!("pledge-sync is running");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    normalizer.stop().await;

    scanner_handle.abort();
    reconciler_handle.abort();
    normalizer_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("pledge-sync stopped");
    Ok(())
}

/// Read the funding account key from the configured environment variable.
/// Without one the process runs read-only and the normalizer stays inert.
fn load_funding_wallet(settings: &Settings) -> Result<Option<LocalWallet>> {
    let Some(ref env_name) = settings.wallet.funding_key_env else {
        return Ok(None);
    };

    match std::env::var(env_name) {
        Ok(key) => {
            let wallet: LocalWallet = key
                .trim()
                .trim_start_matches("0x")
                .parse()
                .context("Invalid funding account key")?;
            Ok(Some(wallet))
        }
        Err(_) => {
            warn!(
                "Environment variable {} not set, running without a funding account",
                env_name
            );
            Ok(None)
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pledge_sync=debug,sqlx=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
