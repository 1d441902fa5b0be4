//! EVM chain provider with multi-RPC support and automatic failover

use super::{ChainClient, RawTransaction};
use crate::config::ChainConfig;
use crate::error::{NodeError, NodeResult};
use crate::types::{Asset, Chain, Coin, Coins};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    chain: Chain,
    native_asset: Asset,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    pub fn new(config: &ChainConfig) -> NodeResult<Self> {
        let chain = Chain::new(&config.chain)?;
        let native_asset: Asset = config.native_asset.parse()?;
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", chain, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(NodeError::ChainConnection {
                chain: chain.to_string(),
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            chain,
            native_asset,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain, next);
    }

    fn connection_error(&self, message: impl Into<String>) -> NodeError {
        NodeError::ChainConnection {
            chain: self.chain.to_string(),
            message: message.into(),
        }
    }

    pub async fn get_block_number(&self) -> NodeResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.chain, e);
                    self.failover();
                }
            }
        }
        Err(self.connection_error("All providers failed"))
    }

    async fn get_block_with_txs(&self, height: u64) -> NodeResult<Option<Block<Transaction>>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_with_txs(height).await {
                Ok(block) => return Ok(block),
                Err(e) => {
                    warn!("Failed to get block {} from chain {}: {}", height, self.chain, e);
                    self.failover();
                }
            }
        }
        Err(self.connection_error(format!("All providers failed to get block {}", height)))
    }

    fn to_raw(&self, tx: &Transaction) -> Option<RawTransaction> {
        let amount = match u128::try_from(tx.value) {
            Ok(amount) => amount,
            Err(_) => {
                warn!("Transaction {:?} value {} overflows", tx.hash, tx.value);
                return None;
            }
        };
        let coins = if amount == 0 {
            Coins::default()
        } else {
            Coins::new(vec![Coin::new(self.native_asset.clone(), amount)])
        };
        Some(RawTransaction {
            hash: format!("{:?}", tx.hash),
            from: format!("{:?}", tx.from),
            to: tx.to.map(|to| format!("{:?}", to)),
            coins,
            memo: String::from_utf8_lossy(&tx.input).trim().to_string(),
        })
    }

    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain, e);
                false
            }
        }
    }
}

#[async_trait]
impl ChainClient for ChainProvider {
    fn chain(&self) -> Chain {
        self.chain.clone()
    }

    async fn current_height(&self) -> NodeResult<u64> {
        self.get_block_number().await
    }

    async fn fetch_block(&self, height: u64) -> NodeResult<Vec<RawTransaction>> {
        let block = self
            .get_block_with_txs(height)
            .await?
            .ok_or_else(|| NodeError::BlockNotAvailable {
                chain: self.chain.to_string(),
                height,
            })?;
        Ok(block
            .transactions
            .iter()
            .filter_map(|tx| self.to_raw(tx))
            .collect())
    }
}
