//! Network fee deduction and gas accounting for outbound payments

use crate::types::{Asset, Chain, Coin};

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Result of charging the network fee on one outbound payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeeOutcome {
    /// Payment survives the fee; `fee` is what was withheld, if anything
    Payable { coin: Coin, fee: Option<Coin> },
    /// Payment does not cover the fee
    BelowFloor { fee: u128 },
}

/// Fee schedule plus running totals of fees withheld and gas spent
#[derive(Debug, Clone, Default)]
pub struct GasManager {
    /// Flat fee per outbound, in base units of the paid coin
    network_fees: HashMap<Chain, u128>,
    collected: BTreeMap<Asset, u128>,
    spent: BTreeMap<Chain, u128>,
}

impl GasManager {
    pub fn new(network_fees: HashMap<Chain, u128>) -> Self {
        Self {
            network_fees,
            collected: BTreeMap::new(),
            spent: BTreeMap::new(),
        }
    }

    pub fn network_fee(&self, chain: &Chain) -> u128 {
        self.network_fees.get(chain).copied().unwrap_or(0)
    }

    pub fn set_network_fee(&mut self, chain: &Chain, fee: u128) {
        self.network_fees.insert(chain.clone(), fee);
    }

    /// Withhold the chain's network fee from `coin`
    pub fn apply_fee(&self, coin: &Coin) -> FeeOutcome {
        let fee = self.network_fee(&coin.asset.chain);
        if fee == 0 {
            return FeeOutcome::Payable {
                coin: coin.clone(),
                fee: None,
            };
        }
        if coin.amount <= fee {
            return FeeOutcome::BelowFloor { fee };
        }
        FeeOutcome::Payable {
            coin: Coin::new(coin.asset.clone(), coin.amount - fee),
            fee: Some(Coin::new(coin.asset.clone(), fee)),
        }
    }

    /// Record a withheld fee once its payment is committed to the outbound queue
    pub fn record_collected(&mut self, fee: &Coin) {
        let total = self.collected.entry(fee.asset.clone()).or_insert(0);
        *total = total.saturating_add(fee.amount);
        debug!("Collected {} network fee, total {} {}", fee, total, fee.asset);
    }

    pub fn collected(&self) -> &BTreeMap<Asset, u128> {
        &self.collected
    }

    /// Charge gas burnt by a settled outbound to its chain
    pub fn add_gas_fees(&mut self, chain: &Chain, amount: u128) {
        let total = self.spent.entry(chain.clone()).or_insert(0);
        *total = total.saturating_add(amount);
    }

    pub fn spent(&self) -> &BTreeMap<Chain, u128> {
        &self.spent
    }
}
