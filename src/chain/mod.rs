//! Chain module - external chain access and block scanning
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - A generic height-by-height block scanner with durable retry state
//! - Extraction of vault transfers into ledger messages
//! - A cached view of the vault addresses to watch

pub mod addresses;
pub mod provider;
pub mod scanner;
pub mod source;

pub use addresses::AddressManager;
pub use provider::ChainProvider;
pub use scanner::{BlockScanner, BlockSink, BlockSource, ScannerConfig};
pub use source::ChainBlockSource;

use crate::config::Settings;
use crate::error::NodeResult;
use crate::metrics::Metrics;
use crate::observer::ObservationQueue;
use crate::state::LocalStore;
use crate::types::{Chain, Coins};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A transaction as read from a chain, before any validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub coins: Coins,
    pub memo: String,
}

/// Read access to one external chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    fn chain(&self) -> Chain;

    async fn current_height(&self) -> NodeResult<u64>;

    /// Transactions in block `height`; `BlockNotAvailable` if it is not produced yet
    async fn fetch_block(&self, height: u64) -> NodeResult<Vec<RawTransaction>>;
}

pub type ObservationScanner = BlockScanner<ChainBlockSource<ChainProvider>, ObservationQueue>;

/// Owns the provider and scanner of every configured chain
pub struct ChainManager {
    providers: DashMap<Chain, Arc<ChainProvider>>,
    scanners: DashMap<Chain, Arc<ObservationScanner>>,
    messages: Mutex<Vec<mpsc::Receiver<u64>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ChainManager {
    pub fn new(
        settings: &Settings,
        store: Arc<LocalStore>,
        queue: Arc<ObservationQueue>,
        addresses: Arc<AddressManager>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> NodeResult<Self> {
        let providers = DashMap::new();
        let scanners = DashMap::new();
        let mut messages = Vec::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!("Initializing chain {} ({})", name, chain_config.chain);

            let provider = Arc::new(ChainProvider::new(chain_config)?);
            let chain = provider.chain();
            providers.insert(chain.clone(), provider.clone());

            let source = Arc::new(ChainBlockSource::new(
                provider,
                addresses.clone(),
                metrics.clone(),
            ));
            let (scanner, rx) = BlockScanner::new(
                source,
                queue.clone(),
                store.clone(),
                metrics.clone(),
                ScannerConfig::from_chain(chain_config, settings.node.channel_capacity),
                cancel.child_token(),
            );
            scanners.insert(chain, Arc::new(scanner));
            messages.push(rx);
        }

        Ok(Self {
            providers,
            scanners,
            messages: Mutex::new(messages),
            handles: Mutex::new(Vec::new()),
            cancel,
        })
    }

    /// Hand the per-chain completed-height channels to their consumer
    pub async fn take_messages(&self) -> Vec<mpsc::Receiver<u64>> {
        std::mem::take(&mut *self.messages.lock().await)
    }

    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        for entry in self.scanners.iter() {
            handles.extend(entry.value().start());
        }
        info!("Started {} chain scanners", self.scanners.len());
    }

    pub fn provider(&self, chain: &Chain) -> Option<Arc<ChainProvider>> {
        self.providers.get(chain).map(|p| p.clone())
    }

    pub async fn health_check(&self) -> Vec<(Chain, bool)> {
        let mut results = Vec::new();
        for entry in self.providers.iter() {
            let healthy = entry.value().health_check().await;
            results.push((entry.key().clone(), healthy));
        }
        results
    }

    pub fn connected_chains(&self) -> Vec<Chain> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    /// Cancel all scanners and wait for them to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        futures::future::join_all(handles).await;
        info!("Chain manager stopped");
    }
}
