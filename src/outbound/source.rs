//! Ledger heights as a block source

use crate::chain::BlockSource;
use crate::error::NodeResult;
use crate::ledger::{LedgerClient, TxOutItem};
use crate::types::PubKey;

use async_trait::async_trait;
use std::sync::Arc;

/// Name under which the ledger scan position is stored
pub const LEDGER_SOURCE: &str = "LEDGER";

/// Yields the unsettled outbound items a given vault must pay
pub struct TxOutSource {
    ledger: Arc<dyn LedgerClient>,
    vault: PubKey,
}

impl TxOutSource {
    pub fn new(ledger: Arc<dyn LedgerClient>, vault: PubKey) -> Self {
        Self { ledger, vault }
    }
}

#[async_trait]
impl BlockSource for TxOutSource {
    type Item = TxOutItem;

    fn name(&self) -> String {
        LEDGER_SOURCE.to_string()
    }

    /// The open height still takes items, so only the one below it is final
    async fn latest_height(&self) -> NodeResult<u64> {
        Ok(self.ledger.height().await?.saturating_sub(1))
    }

    async fn extract(&self, height: u64) -> NodeResult<Vec<TxOutItem>> {
        let block = self.ledger.tx_out(height).await?;
        Ok(block
            .items
            .into_iter()
            .filter(|item| item.vault_pub_key == self.vault && !item.is_settled())
            .collect())
    }
}
