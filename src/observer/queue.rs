//! Local observation queue
//!
//! Durable buffer between the chain scanners and ledger submission. Items
//! survive restarts; an item is only removed once the ledger accepted it or
//! rejected it for good.

use crate::chain::scanner::BlockSink;
use crate::error::NodeResult;
use crate::messages::LedgerMsg;
use crate::state::{LocalQueueItem, LocalStore};
use crate::types::TxKey;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ObservationQueue {
    store: Arc<LocalStore>,
}

impl ObservationQueue {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, msg: &LedgerMsg) -> NodeResult<bool> {
        let added = self.store.enqueue(msg).await?;
        if let (true, Some(key)) = (added, msg.key()) {
            debug!("Queued {} {}", msg.name(), key);
        }
        Ok(added)
    }

    pub async fn dequeue(&self, include_retries: bool) -> NodeResult<Vec<LocalQueueItem>> {
        self.store.dequeue(include_retries).await
    }

    /// Claim `key` for one worker; false if it is already claimed or gone
    pub async fn mark_processing(&self, key: &TxKey) -> NodeResult<bool> {
        self.store.mark_processing(key).await
    }

    pub async fn mark_failed(&self, key: &TxKey) -> NodeResult<()> {
        self.store.mark_failed(key).await
    }

    pub async fn remove(&self, key: &TxKey) -> NodeResult<()> {
        self.store.remove(key).await
    }

    /// Return items a previous run left claimed to the retry pool
    pub async fn recover(&self) -> NodeResult<u64> {
        let reset = self.store.reset_in_flight().await?;
        if reset > 0 {
            info!("Recovered {} in-flight observations from previous run", reset);
        }
        Ok(reset)
    }

    pub async fn depth(&self) -> NodeResult<u64> {
        self.store.queue_depth().await
    }
}

#[async_trait]
impl BlockSink<LedgerMsg> for ObservationQueue {
    async fn accept(&self, height: u64, items: Vec<LedgerMsg>) -> NodeResult<()> {
        for msg in &items {
            self.enqueue(msg).await?;
        }
        if !items.is_empty() {
            debug!("Block {} queued {} observations", height, items.len());
        }
        Ok(())
    }
}
