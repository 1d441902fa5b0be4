//! Vault generations and churn
//!
//! Every churn installs a new generation of vaults. The generation active at a
//! ledger height is *Current*; the one before it is *Previous* and stays
//! authorized until the grace window after the rotation runs out, or until the
//! next churn retires it, whichever comes first.

use crate::error::{LedgerError, LedgerResult};
use crate::types::{Address, Chain, PubKey};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

/// One custodial vault on one external chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultAddress {
    pub chain: Chain,
    pub pub_key: PubKey,
    pub address: Address,
}

/// Current and previous vaults as seen at some ledger height
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultAddressSet {
    /// Ledger height at which `current` became active
    pub rotated_at: u64,
    pub current: Vec<VaultAddress>,
    pub previous: Vec<VaultAddress>,
}

impl VaultAddressSet {
    pub fn current_for(&self, chain: &Chain) -> Option<&VaultAddress> {
        self.current.iter().find(|v| &v.chain == chain)
    }

    pub fn previous_for(&self, chain: &Chain) -> Option<&VaultAddress> {
        self.previous.iter().find(|v| &v.chain == chain)
    }

    /// Vault (current first, then previous) owning `address` on `chain`
    pub fn find(&self, chain: &Chain, address: &Address) -> Option<&VaultAddress> {
        self.current
            .iter()
            .chain(self.previous.iter())
            .find(|v| &v.chain == chain && &v.address == address)
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.previous.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Generation {
    activated_at: u64,
    vaults: Vec<VaultAddress>,
}

impl Generation {
    fn for_chain(&self, chain: &Chain) -> Option<&VaultAddress> {
        self.vaults.iter().find(|v| &v.chain == chain)
    }
}

/// Ledger-side registry of vault generations
#[derive(Debug, Clone)]
pub struct VaultManager {
    generations: Vec<Generation>,
    grace_window: u64,
}

fn check_one_per_chain(vaults: &[VaultAddress]) -> LedgerResult<()> {
    let mut seen = BTreeSet::new();
    for v in vaults {
        if !seen.insert(v.chain.clone()) {
            return Err(LedgerError::InvalidMessage(format!(
                "more than one current vault for chain {}",
                v.chain
            )));
        }
    }
    Ok(())
}

impl VaultManager {
    pub fn new(genesis: Vec<VaultAddress>, grace_window: u64) -> LedgerResult<Self> {
        check_one_per_chain(&genesis)?;
        Ok(Self {
            generations: vec![Generation {
                activated_at: 0,
                vaults: genesis,
            }],
            grace_window,
        })
    }

    pub fn grace_window(&self) -> u64 {
        self.grace_window
    }

    /// Applies to rotations past and future; a previous vault may regain or lose grace
    pub fn set_grace_window(&mut self, blocks: u64) {
        self.grace_window = blocks;
    }

    /// Rotate: the current generation becomes previous and `vaults` becomes current
    pub fn churn(&mut self, height: u64, vaults: Vec<VaultAddress>) -> LedgerResult<()> {
        check_one_per_chain(&vaults)?;
        let latest = self.latest().activated_at;
        if height <= latest {
            return Err(LedgerError::HeightRegression {
                what: "vault rotation".to_string(),
                current: latest,
                proposed: height,
            });
        }
        info!(
            "Vault churn at height {}: {} vaults installed, grace window {} blocks",
            height,
            vaults.len(),
            self.grace_window
        );
        self.generations.push(Generation {
            activated_at: height,
            vaults,
        });
        Ok(())
    }

    fn latest(&self) -> &Generation {
        // new() always installs a genesis generation
        &self.generations[self.generations.len() - 1]
    }

    fn index_at(&self, height: u64) -> usize {
        self.generations
            .iter()
            .rposition(|g| g.activated_at <= height)
            .unwrap_or(0)
    }

    /// Previous generation at `height`, if it is still inside its grace window
    fn previous_in_grace(&self, height: u64) -> Option<&Generation> {
        let idx = self.index_at(height);
        if idx == 0 {
            return None;
        }
        let rotated_at = self.generations[idx].activated_at;
        if height < rotated_at.saturating_add(self.grace_window) {
            Some(&self.generations[idx - 1])
        } else {
            None
        }
    }

    /// Vault set as it was authoritative at `height`
    pub fn vaults_at(&self, height: u64) -> VaultAddressSet {
        let idx = self.index_at(height);
        VaultAddressSet {
            rotated_at: self.generations[idx].activated_at,
            current: self.generations[idx].vaults.clone(),
            previous: self
                .previous_in_grace(height)
                .map(|g| g.vaults.clone())
                .unwrap_or_default(),
        }
    }

    /// True if `address` may receive inbound or originate outbound on `chain` at `height`
    pub fn is_authorized(&self, chain: &Chain, address: &Address, height: u64) -> bool {
        let current = &self.generations[self.index_at(height)];
        if current
            .for_chain(chain)
            .map_or(false, |v| &v.address == address)
        {
            return true;
        }
        self.previous_in_grace(height)
            .and_then(|g| g.for_chain(chain))
            .map_or(false, |v| &v.address == address)
    }

    /// The single vault new outbound payments on `chain` are assigned to
    pub fn authorized_vault(&self, chain: &Chain, height: u64) -> Option<&VaultAddress> {
        self.generations[self.index_at(height)]
            .for_chain(chain)
            .or_else(|| self.previous_in_grace(height).and_then(|g| g.for_chain(chain)))
    }
}
