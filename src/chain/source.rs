//! Extraction of vault transfers from external chain blocks

use super::addresses::AddressManager;
use super::scanner::BlockSource;
use super::{ChainClient, RawTransaction};
use crate::error::{NodeError, NodeResult};
use crate::ledger::VaultAddressSet;
use crate::memo::Memo;
use crate::messages::LedgerMsg;
use crate::metrics::Metrics;
use crate::types::{Address, Chain, ObservedTransfer, TxId};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Turns blocks of one chain into ledger messages about vault transfers
pub struct ChainBlockSource<C> {
    client: Arc<C>,
    chain: Chain,
    addresses: Arc<AddressManager>,
    metrics: Arc<Metrics>,
}

impl<C: ChainClient> ChainBlockSource<C> {
    pub fn new(client: Arc<C>, addresses: Arc<AddressManager>, metrics: Arc<Metrics>) -> Self {
        let chain = client.chain();
        Self {
            client,
            chain,
            addresses,
            metrics,
        }
    }

    /// `Ok(None)` for transactions that do not touch a vault
    fn extract_one(
        &self,
        height: u64,
        tx: &RawTransaction,
        vaults: &VaultAddressSet,
    ) -> NodeResult<Option<LedgerMsg>> {
        let Some(to) = tx.to.as_deref() else {
            return Ok(None);
        };
        let to = Address::new(to)?;
        let from = Address::new(&tx.from)?;
        let inbound_vault = vaults.find(&self.chain, &to);
        let outbound_vault = vaults.find(&self.chain, &from);
        if inbound_vault.is_none() && outbound_vault.is_none() {
            return Ok(None);
        }
        if tx.coins.is_empty() {
            return Ok(None);
        }

        let memo: Memo = tx.memo.parse()?;
        let observed_vault = match (&memo, inbound_vault, outbound_vault) {
            (Memo::Outbound { .. }, _, Some(vault)) => vault,
            (Memo::Outbound { .. }, Some(_), None) => {
                return Err(NodeError::Malformed(format!(
                    "outbound memo on transfer {} into a vault",
                    tx.hash
                )))
            }
            (_, Some(vault), _) => vault,
            (_, None, Some(_)) => {
                // vault spending without an outbound memo, e.g. gas top-ups
                debug!("Ignoring non-outbound spend {} from vault", tx.hash);
                return Ok(None);
            }
            (_, None, None) => return Ok(None),
        };

        let transfer = ObservedTransfer {
            chain: self.chain.clone(),
            tx_id: TxId::new(&tx.hash)?,
            block_height: height,
            from,
            to,
            coins: tx.coins.clone(),
            memo: memo.to_string(),
            observed_vault: observed_vault.pub_key.clone(),
        };
        Ok(Some(LedgerMsg::from_transfer(transfer, &memo)))
    }
}

#[async_trait]
impl<C: ChainClient> BlockSource for ChainBlockSource<C> {
    type Item = LedgerMsg;

    fn name(&self) -> String {
        self.chain.to_string()
    }

    async fn latest_height(&self) -> NodeResult<u64> {
        self.client.current_height().await
    }

    async fn extract(&self, height: u64) -> NodeResult<Vec<LedgerMsg>> {
        let txs = self.client.fetch_block(height).await?;
        let vaults = self.addresses.snapshot().await;
        let mut messages = Vec::new();
        for tx in &txs {
            match self.extract_one(height, tx, &vaults) {
                Ok(Some(msg)) => messages.push(msg),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Dropping malformed transfer {} in {} block {}: {}",
                        tx.hash, self.chain, height, e
                    );
                    self.metrics.record_error("extractor", e.class());
                }
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::ledger::client::MockLedgerClient;
    use crate::ledger::VaultAddress;
    use crate::types::fixtures::*;
    use crate::types::{Coins, PubKey};
    use std::time::Duration;

    fn raw(hash: &str, from: Address, to: Address, amount: u128, memo: &str) -> RawTransaction {
        RawTransaction {
            hash: hash.to_string(),
            from: from.to_string(),
            to: Some(to.to_string()),
            coins: Coins::new(vec![coin("ETH.ETH", amount)]),
            memo: memo.to_string(),
        }
    }

    async fn source(txs: Vec<RawTransaction>) -> ChainBlockSource<MockChainClient> {
        let mut client = MockChainClient::new();
        client.expect_chain().returning(|| chain("ETH"));
        client
            .expect_fetch_block()
            .returning(move |_| Ok(txs.clone()));

        let mut ledger = MockLedgerClient::new();
        ledger.expect_vaults().returning(|| {
            Ok(VaultAddressSet {
                rotated_at: 0,
                current: vec![VaultAddress {
                    chain: chain("ETH"),
                    pub_key: PubKey::new("vault1").unwrap(),
                    address: addr(0x01),
                }],
                previous: vec![],
            })
        });
        let addresses = Arc::new(AddressManager::new(
            Arc::new(ledger),
            Duration::from_secs(60),
        ));
        addresses.refresh().await.unwrap();
        ChainBlockSource::new(
            Arc::new(client),
            addresses,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_extracts_vault_transfers_only() {
        let source = source(vec![
            raw("0x01", addr(0xaa), addr(0x01), 10, "SWAP:ETH.USDT"),
            raw("0x02", addr(0xaa), addr(0xbb), 10, "SWAP:ETH.USDT"),
            raw("0x03", addr(0x01), addr(0xaa), 9, "OUTBOUND:0x01"),
            raw("0x04", addr(0x01), addr(0xaa), 9, "GAS"),
        ])
        .await;

        let msgs = source.extract(77).await.unwrap();
        assert_eq!(msgs.len(), 2);
        match &msgs[0] {
            LedgerMsg::Observation(t) => {
                assert_eq!(t.tx_id, TxId::new("01").unwrap());
                assert_eq!(t.block_height, 77);
                assert_eq!(t.observed_vault.as_str(), "vault1");
            }
            other => panic!("unexpected {:?}", other),
        }
        match &msgs[1] {
            LedgerMsg::OutboundObservation(o) => {
                assert_eq!(o.in_tx, TxId::new("01").unwrap());
                assert_eq!(o.outbound.from, addr(0x01));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_memo_dropped_not_fatal() {
        let source = source(vec![
            raw("0x01", addr(0xaa), addr(0x01), 10, "not a memo"),
            raw("0x02", addr(0xaa), addr(0x01), 10, "=:ETH.USDT"),
        ])
        .await;
        let msgs = source.extract(1).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].transfer().unwrap().memo, "SWAP:ETH.USDT");
    }

    #[tokio::test]
    async fn test_block_not_available_propagates() {
        let mut client = MockChainClient::new();
        client.expect_chain().returning(|| chain("ETH"));
        client.expect_fetch_block().returning(|h| {
            Err(NodeError::BlockNotAvailable {
                chain: "ETH".into(),
                height: h,
            })
        });
        let ledger = MockLedgerClient::new();
        let source = ChainBlockSource::new(
            Arc::new(client),
            Arc::new(AddressManager::new(Arc::new(ledger), Duration::from_secs(60))),
            Arc::new(Metrics::new().unwrap()),
        );
        let err = source.extract(9).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
