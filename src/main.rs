//! evm-txm - transaction manager service
//!
//! Loads settings, connects the store and chain client, then runs the
//! transaction manager with its operator API and metrics server until a
//! shutdown signal arrives.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use evm_txm::chain::{ChainClient, EthersChainClient};
use evm_txm::config::Settings;
use evm_txm::metrics::{MetricsRecorder, MetricsServer, NoopRecorder, PrometheusRecorder};
use evm_txm::state::{PgTxStore, TxStore};
use evm_txm::tx::{new_estimator, KeyStore, TxManager};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting evm-txm v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        chain_id = settings.chain.chain_id,
        rpc_urls = settings.chain.rpc_urls.len(),
        estimator = ?settings.gas.mode,
        "Loaded configuration"
    );

    let store = PgTxStore::new(&settings.database)
        .await
        .context("Failed to connect to database")?;
    store.run_migrations().await?;
    info!("Database migrations complete");
    let store: Arc<dyn TxStore> = Arc::new(store);

    let client: Arc<dyn ChainClient> = Arc::new(EthersChainClient::new(
        &settings.chain,
        settings.txm.rpc_timeout(),
    )?);

    let keys = Arc::new(KeyStore::from_env(
        &settings.wallet.private_keys_env,
        settings.chain.chain_id,
    )?);
    info!(keys = keys.addresses().len(), "Loaded signing keys");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (metrics, metrics_handle): (Arc<dyn MetricsRecorder>, _) = if settings.metrics.enabled {
        let recorder = PrometheusRecorder::new(settings.chain.chain_id)?;
        let server = MetricsServer::new(settings.metrics.port, recorder.registry());
        let rx = shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = server.run(rx).await {
                error!("Metrics server error: {}", e);
            }
        });
        (Arc::new(recorder), Some(handle))
    } else {
        (Arc::new(NoopRecorder), None)
    };

    let estimator = new_estimator(client.clone(), &settings.gas, &settings.block_history);
    let manager = Arc::new(TxManager::new(
        store,
        client,
        estimator,
        keys,
        metrics,
        settings.txm.clone(),
        settings.gas.clone(),
    ));
    manager.start().await?;

    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let manager = manager.clone();
        let rx = shutdown_rx.clone();
        async move {
            if let Err(e) = evm_txm::api::run_server(config, manager, rx).await {
                error!("API server error: {}", e);
            }
        }
    });

    info!("evm-txm is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    manager.stop().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = api_handle.await {
        error!("API server task failed: {}", e);
    }
    if let Some(handle) = metrics_handle {
        if let Err(e) = handle.await {
            error!("Metrics server task failed: {}", e);
        }
    }

    info!("evm-txm stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,evm_txm=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("TXM_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
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
