//! Vault Observer - cross-chain observation and settlement node
//!
//! Watches external chains for transfers touching the network's vaults,
//! submits signed observations to the ledger, and broadcasts the outbound
//! payments the ledger schedules for vaults this node controls.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod ledger;
mod memo;
mod messages;
mod metrics;
mod observer;
mod outbound;
mod state;
mod types;

use chain::{AddressManager, BlockScanner, ChainManager};
use config::{LedgerMode, Settings};
use ledger::{HttpLedgerClient, Ledger, LedgerClient, LocalLedger};
use metrics::{Metrics, MetricsServer};
use observer::{MessageSigner, ObservationQueue, Observer, ObserverConfig, WalletSigner};
use outbound::{EvmBroadcaster, OutboundSigner, TxOutSource};
use state::LocalStore;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Vault Observer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::new()?);

    let store = Arc::new(LocalStore::connect(&settings.store.url).await?);
    store.run_migrations().await?;
    info!("Local store ready");

    let signer = Arc::new(WalletSigner::from_env(&settings.node.private_key_env)?);
    info!("Node identity {}", signer.node_id());

    // Ledger: hosted in-process, or reached over HTTP
    let mut handles = Vec::new();
    let (ledger_client, local_ledger): (Arc<dyn LedgerClient>, Option<Arc<LocalLedger>>) =
        match settings.ledger.mode {
            LedgerMode::Local => {
                let ledger = Ledger::from_config(&settings.ledger, metrics.clone())?;
                let local = Arc::new(LocalLedger::new(ledger));
                let block_time = Duration::from_millis(settings.ledger.block_time_ms.max(1));
                handles.push(tokio::spawn({
                    let local = local.clone();
                    let cancel = cancel.child_token();
                    async move { local.run(block_time, cancel).await }
                }));
                (local.clone() as Arc<dyn LedgerClient>, Some(local))
            }
            LedgerMode::Remote => {
                let url = settings.ledger.remote_url.clone().unwrap_or_default();
                info!("Using remote ledger at {}", url);
                let client = HttpLedgerClient::new(&url, settings.node.submit_timeout())?;
                (Arc::new(client) as Arc<dyn LedgerClient>, None)
            }
        };

    // Vault addresses to watch
    let addresses = Arc::new(AddressManager::new(
        ledger_client.clone(),
        Duration::from_secs(settings.node.address_refresh_secs.max(1)),
    ));
    if let Err(e) = addresses.refresh().await {
        warn!("Initial vault refresh failed, scanners start without vaults: {}", e);
    }
    handles.push(tokio::spawn({
        let addresses = addresses.clone();
        let cancel = cancel.child_token();
        async move { addresses.run(cancel).await }
    }));

    // Chain scanners feeding the local queue
    let queue = Arc::new(ObservationQueue::new(store.clone()));
    let chain_manager = Arc::new(ChainManager::new(
        &settings,
        store.clone(),
        queue.clone(),
        addresses.clone(),
        metrics.clone(),
        cancel.child_token(),
    )?);
    info!("Chain connections initialized");

    let observer = Arc::new(Observer::new(
        queue.clone(),
        ledger_client.clone(),
        signer.clone(),
        metrics.clone(),
        ObserverConfig::from(&settings.node),
        cancel.child_token(),
    ));
    observer.start(chain_manager.take_messages().await).await?;
    chain_manager.start().await;

    // Ledger-side scanner broadcasting our vault's outbounds
    let mut outbound_sink = OutboundSigner::new(store.clone(), metrics.clone());
    for (_, chain_config) in settings.enabled_chains() {
        let chain = types::Chain::new(&chain_config.chain)?;
        if let Some(provider) = chain_manager.provider(&chain) {
            outbound_sink = outbound_sink.with_broadcaster(Arc::new(EvmBroadcaster::new(
                provider,
                chain_config.native_asset.parse()?,
                signer.wallet().clone(),
                settings.node.submit_timeout(),
            )));
        }
    }
    // nothing waits on ledger heights, so the completion channel is dropped
    let (outbound_scanner, _) = BlockScanner::new(
        Arc::new(TxOutSource::new(ledger_client.clone(), signer.vault_pub_key()?)),
        Arc::new(outbound_sink),
        store.clone(),
        metrics.clone(),
        outbound::scanner_config(&settings),
        cancel.child_token(),
    );
    let outbound_scanner = Arc::new(outbound_scanner);
    handles.extend(outbound_scanner.start());

    // API server
    if settings.api.enabled {
        let mut scanners: Vec<String> = chain_manager
            .connected_chains()
            .iter()
            .map(|c| c.to_string())
            .collect();
        scanners.push(outbound_scanner.name().to_string());
        let state = api::AppState {
            store: store.clone(),
            queue: queue.clone(),
            scanners,
            ledger: local_ledger.clone(),
        };
        let config = settings.api.clone();
        let cancel = cancel.child_token();
        handles.push(tokio::spawn(async move {
            if let Err(e) = api::run_server(config, state, cancel).await {
                error!("API server error: {}", e);
            }
        }));
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    }

    // Metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port, metrics.clone());
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    handles.push(tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let cancel = cancel.child_token();
        async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                }
                for (chain, healthy) in chain_manager.health_check().await {
                    if !healthy {
                        warn!("Chain {} health check failed", chain);
                    }
                }
                if let Err(e) = store.health_check().await {
                    warn!("Local store health check failed: {}", e);
                }
            }
        }
    }));

    info!("Vault Observer is running");

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    cancel.cancel();
    chain_manager.stop().await;
    observer.stop().await;
    futures::future::join_all(handles).await;
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Vault Observer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,vault_observer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Cannot listen for Ctrl+C: {}", e);
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
                error!("Cannot listen for SIGTERM: {}", e);
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
