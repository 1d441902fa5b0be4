//! Signing and sending outbound payments on external chains

use crate::chain::{ChainClient, ChainProvider};
use crate::error::{NodeError, NodeResult};
use crate::ledger::TxOutItem;
use crate::types::{Asset, Chain, TxId};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

/// Sends outbound payments from this node's wallet on one chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    fn chain(&self) -> Chain;

    /// Next nonce the chain expects, counting transactions still in the mempool
    async fn pending_nonce(&self) -> NodeResult<u64>;

    /// Number of this wallet's transactions already mined
    async fn mined_nonce(&self) -> NodeResult<u64>;

    /// Send `item` at `nonce`. Resending the same nonce replaces, never duplicates.
    async fn broadcast(&self, item: &TxOutItem, nonce: u64) -> NodeResult<TxId>;
}

/// Native-asset transfers on an EVM chain, memo carried in the calldata
pub struct EvmBroadcaster {
    provider: Arc<ChainProvider>,
    native_asset: Asset,
    wallet: LocalWallet,
    send_timeout: Duration,
}

impl EvmBroadcaster {
    pub fn new(
        provider: Arc<ChainProvider>,
        native_asset: Asset,
        wallet: LocalWallet,
        send_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            native_asset,
            wallet,
            send_timeout,
        }
    }

    fn error(&self, message: impl Into<String>) -> NodeError {
        NodeError::Broadcast {
            chain: self.provider.chain().to_string(),
            message: message.into(),
        }
    }

    async fn transaction_count(&self, block: BlockNumber) -> NodeResult<u64> {
        let count = timeout(
            self.send_timeout,
            self.provider
                .http()
                .get_transaction_count(self.wallet.address(), Some(block.into())),
        )
        .await
        .map_err(|_| NodeError::Timeout {
            operation: format!("nonce of {:?}", self.wallet.address()),
        })?
        .map_err(|e| self.error(e.to_string()))?;
        Ok(count.as_u64())
    }
}

#[async_trait]
impl Broadcaster for EvmBroadcaster {
    fn chain(&self) -> Chain {
        self.provider.chain()
    }

    async fn pending_nonce(&self) -> NodeResult<u64> {
        self.transaction_count(BlockNumber::Pending).await
    }

    async fn mined_nonce(&self) -> NodeResult<u64> {
        self.transaction_count(BlockNumber::Latest).await
    }

    async fn broadcast(&self, item: &TxOutItem, nonce: u64) -> NodeResult<TxId> {
        if item.coin.asset != self.native_asset {
            return Err(NodeError::Malformed(format!(
                "cannot pay {} from a native {} vault",
                item.coin.asset, self.native_asset
            )));
        }
        let to: Address = item
            .to
            .as_str()
            .parse()
            .map_err(|e| NodeError::Malformed(format!("recipient {}: {}", item.to, e)))?;

        let http = self.provider.http().clone();
        let chain_id = http
            .get_chainid()
            .await
            .map_err(|e| self.error(e.to_string()))?;
        let client = SignerMiddleware::new(http, self.wallet.clone().with_chain_id(chain_id.as_u64()));

        let tx = TransactionRequest::new()
            .to(to)
            .value(U256::from(item.coin.amount))
            .data(Bytes::from(item.memo.clone().into_bytes()))
            .nonce(nonce);

        let pending = timeout(self.send_timeout, client.send_transaction(tx, None))
            .await
            .map_err(|_| NodeError::Timeout {
                operation: format!("broadcast outbound for {}", item.in_tx),
            })?
            .map_err(|e| self.error(e.to_string()))?;

        let tx_hash = pending.tx_hash();
        info!(
            "Broadcast outbound {:?} (nonce {}) paying {} for {}",
            tx_hash, nonce, item.coin, item.in_tx
        );
        TxId::new(&format!("{:?}", tx_hash))
    }
}
