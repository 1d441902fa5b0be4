//! Node-side cache of the vault addresses to watch

use crate::error::NodeResult;
use crate::ledger::{LedgerClient, VaultAddressSet};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodically refreshed copy of the ledger's current and previous vaults
pub struct AddressManager {
    ledger: Arc<dyn LedgerClient>,
    current: RwLock<VaultAddressSet>,
    refresh_interval: Duration,
}

impl AddressManager {
    pub fn new(ledger: Arc<dyn LedgerClient>, refresh_interval: Duration) -> Self {
        Self {
            ledger,
            current: RwLock::new(VaultAddressSet::default()),
            refresh_interval,
        }
    }

    pub async fn snapshot(&self) -> VaultAddressSet {
        self.current.read().await.clone()
    }

    /// Pull the vault set from the ledger; true if it changed
    pub async fn refresh(&self) -> NodeResult<bool> {
        let latest = self.ledger.vaults().await?;
        let mut current = self.current.write().await;
        if *current == latest {
            return Ok(false);
        }
        info!(
            "Vault set updated: {} current, {} previous (rotated at {})",
            latest.current.len(),
            latest.previous.len(),
            latest.rotated_at
        );
        *current = latest;
        Ok(true)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.refresh_interval) => {
                    match self.refresh().await {
                        Ok(changed) => debug!("Vault refresh done, changed: {}", changed),
                        Err(e) => warn!("Vault refresh failed: {}", e),
                    }
                }
            }
        }
    }
}
