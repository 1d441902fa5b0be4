//! Broadcasting sink for scheduled outbound items

use super::broadcaster::Broadcaster;
use crate::chain::BlockSink;
use crate::error::NodeResult;
use crate::ledger::TxOutItem;
use crate::metrics::Metrics;
use crate::state::LocalStore;
use crate::types::Chain;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Broadcasts each item once; a rescanned height skips what was already sent
///
/// Every item gets a nonce reserved in the local store before its first
/// send. A retry after a lost reply resends at that same nonce, so the chain
/// keeps at most one of the attempts.
pub struct OutboundSigner {
    broadcasters: HashMap<Chain, Arc<dyn Broadcaster>>,
    store: Arc<LocalStore>,
    metrics: Arc<Metrics>,
    /// Serializes reservations so two items never take the same nonce
    nonce_lock: Mutex<()>,
}

impl OutboundSigner {
    pub fn new(store: Arc<LocalStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            broadcasters: HashMap::new(),
            store,
            metrics,
            nonce_lock: Mutex::new(()),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcasters.insert(broadcaster.chain(), broadcaster);
        self
    }

    fn item_key(height: u64, item: &TxOutItem) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            height, item.chain, item.in_tx, item.to, item.coin
        )
    }

    /// Nonce for `key`: the reserved one on retry, otherwise the next free one
    async fn nonce_for(
        &self,
        key: &str,
        item: &TxOutItem,
        broadcaster: &dyn Broadcaster,
    ) -> NodeResult<Option<u64>> {
        let _guard = self.nonce_lock.lock().await;
        if let Some(record) = self.store.broadcast_record(key).await? {
            if record.sent {
                debug!(
                    "Outbound for {} already sent as {:?}",
                    item.in_tx, record.out_tx
                );
                return Ok(None);
            }
            if broadcaster.mined_nonce().await? > record.nonce {
                warn!(
                    "Nonce {} for {} already mined, marking outbound sent",
                    record.nonce, item.in_tx
                );
                self.store.record_broadcast(key, None).await?;
                return Ok(None);
            }
            info!("Retrying outbound for {} at nonce {}", item.in_tx, record.nonce);
            return Ok(Some(record.nonce));
        }

        let chain = item.chain.as_str();
        let pending = broadcaster.pending_nonce().await?;
        let next_local = self
            .store
            .highest_nonce(chain)
            .await?
            .map_or(0, |n| n + 1);
        let nonce = pending.max(next_local);
        self.store.reserve_nonce(key, chain, nonce).await?;
        Ok(Some(nonce))
    }

    async fn pay(&self, height: u64, item: &TxOutItem) -> NodeResult<()> {
        let Some(broadcaster) = self.broadcasters.get(&item.chain) else {
            warn!("No broadcaster for {}, cannot pay {}", item.chain, item.in_tx);
            return Ok(());
        };
        let key = Self::item_key(height, item);
        let Some(nonce) = self.nonce_for(&key, item, broadcaster.as_ref()).await? else {
            return Ok(());
        };

        match broadcaster.broadcast(item, nonce).await {
            Ok(out_tx) => {
                self.store.record_broadcast(&key, Some(out_tx.as_str())).await?;
                self.metrics.record_submission(item.chain.as_str(), "broadcast");
                Ok(())
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                error!("Outbound for {} cannot be paid: {}", item.in_tx, e);
                self.store.release_nonce(&key).await?;
                self.metrics.record_error("outbound", e.class());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl BlockSink<TxOutItem> for OutboundSigner {
    async fn accept(&self, height: u64, items: Vec<TxOutItem>) -> NodeResult<()> {
        for item in &items {
            self.pay(height, item).await?;
        }
        Ok(())
    }
}
