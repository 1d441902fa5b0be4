//! Outbound payment queue, bucketed by ledger height
//!
//! Items are appended while their height is open and only the outbound hash
//! can change afterwards. Each item is settled by at most one outbound.

use crate::error::{LedgerError, LedgerResult};
use crate::types::{Address, Chain, Coin, Coins, PubKey, TxId};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One payment the network owes on an external chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutItem {
    pub chain: Chain,
    pub in_tx: TxId,
    /// Vault expected to sign and broadcast the payment
    pub vault_pub_key: PubKey,
    pub to: Address,
    pub coin: Coin,
    pub memo: String,
    /// Hash of the settling outbound, once observed
    pub out_tx: Option<TxId>,
    /// Network fee withheld from `coin`
    pub gas_refund: Option<Coin>,
}

impl TxOutItem {
    pub fn is_settled(&self) -> bool {
        self.out_tx.is_some()
    }
}

/// Outbound items created at one ledger height
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutBlock {
    pub height: u64,
    pub items: Vec<TxOutItem>,
}

#[derive(Debug, Clone, Default)]
pub struct TxOutStore {
    blocks: BTreeMap<u64, TxOutBlock>,
    /// Heights at or below this are closed to new items
    sealed_through: Option<u64>,
}

impl TxOutStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tx_out_item(&mut self, height: u64, item: TxOutItem) -> LedgerResult<()> {
        if let Some(sealed) = self.sealed_through {
            if height <= sealed {
                return Err(LedgerError::HeightRegression {
                    what: "txout".to_string(),
                    current: sealed,
                    proposed: height,
                });
            }
        }
        self.blocks
            .entry(height)
            .or_insert_with(|| TxOutBlock {
                height,
                items: Vec::new(),
            })
            .items
            .push(item);
        Ok(())
    }

    /// Items at `height`; empty when nothing was scheduled there
    pub fn get_tx_out(&self, height: u64) -> TxOutBlock {
        self.blocks.get(&height).cloned().unwrap_or(TxOutBlock {
            height,
            items: Vec::new(),
        })
    }

    /// Close `height` to further appends
    pub fn seal(&mut self, height: u64) {
        self.sealed_through = Some(self.sealed_through.map_or(height, |s| s.max(height)));
    }

    /// Record `out_tx` on the unsettled items for `in_tx` whose coin the outbound carried.
    ///
    /// Each observed coin settles at most one item. Returns the number of items updated.
    pub fn set_outbound_hash(
        &mut self,
        height: u64,
        in_tx: &TxId,
        observed: &Coins,
        out_tx: &TxId,
    ) -> usize {
        let Some(block) = self.blocks.get_mut(&height) else {
            return 0;
        };
        let mut updated = 0;
        for coin in observed.iter() {
            let matching = block
                .items
                .iter_mut()
                .find(|item| &item.in_tx == in_tx && !item.is_settled() && &item.coin == coin);
            if let Some(item) = matching {
                item.out_tx = Some(out_tx.clone());
                updated += 1;
            }
        }
        updated
    }
}
