//! Per-transaction vote aggregation
//!
//! Each node holds at most one vote per transaction; a later vote from the
//! same node replaces its earlier one. Votes only agree when their payload
//! digests agree, so two nodes reporting different amounts never add up.

use crate::error::{LedgerError, LedgerResult};
use crate::types::{NodeId, ObservedTransfer, TxKey};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Fraction of the active node set whose agreement finalizes an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quorum {
    pub numerator: u64,
    pub denominator: u64,
}

impl Default for Quorum {
    fn default() -> Self {
        Self {
            numerator: 2,
            denominator: 3,
        }
    }
}

impl Quorum {
    /// A strict majority that does not exceed the whole set
    pub fn is_valid(&self) -> bool {
        self.numerator > 0
            && self.numerator <= self.denominator
            && self.numerator.saturating_mul(2) > self.denominator
    }

    /// Votes needed out of `active` nodes: `ceil(active * numerator / denominator)`
    pub fn threshold(&self, active: usize) -> usize {
        let active = active as u64;
        let needed = (active * self.numerator + self.denominator - 1) / self.denominator;
        needed.max(1) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationVote {
    pub transfer: ObservedTransfer,
    /// Ledger height the vote was applied at
    pub height: u64,
    digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    /// New vote counted, quorum not yet reached
    Recorded,
    /// Node's earlier vote replaced, quorum not yet reached
    Replaced,
    /// This vote pushed a payload over the threshold
    Finalized,
    /// Already finalized before this vote; recorded but inert
    AlreadyFinalized,
}

impl VoteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteOutcome::Recorded => "recorded",
            VoteOutcome::Replaced => "replaced",
            VoteOutcome::Finalized => "finalized",
            VoteOutcome::AlreadyFinalized => "already_finalized",
        }
    }
}

/// Everything the ledger knows about one external transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTxVoter {
    pub key: TxKey,
    pub votes: BTreeMap<NodeId, ObservationVote>,
    /// Payload that reached quorum; never changes once set
    pub finalized: Option<ObservedTransfer>,
    pub finalized_height: Option<u64>,
    /// Outbound legs the finalized payload scheduled
    pub expected_out: usize,
    /// Outbound transfers observed settling this transaction
    pub out_txs: Vec<ObservedTransfer>,
    pub settled_out: usize,
}

impl ObservedTxVoter {
    pub fn new(key: TxKey) -> Self {
        Self {
            key,
            votes: BTreeMap::new(),
            finalized: None,
            finalized_height: None,
            expected_out: 0,
            out_txs: Vec::new(),
            settled_out: 0,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Finalized and every expected outbound leg has been settled
    pub fn is_done(&self) -> bool {
        self.is_finalized() && self.settled_out >= self.expected_out
    }

    /// Record `node`'s vote and finalize if some payload now has quorum among `active`
    pub fn add_vote(
        &mut self,
        node: &NodeId,
        transfer: ObservedTransfer,
        height: u64,
        active: &BTreeSet<NodeId>,
        quorum: Quorum,
    ) -> LedgerResult<VoteOutcome> {
        if transfer.key() != self.key {
            return Err(LedgerError::InvalidMessage(format!(
                "vote for {} applied to voter {}",
                transfer.key(),
                self.key
            )));
        }
        let digest = transfer
            .digest()
            .map_err(|e| LedgerError::InvalidMessage(e.to_string()))?;
        let replaced = self
            .votes
            .insert(
                node.clone(),
                ObservationVote {
                    transfer,
                    height,
                    digest: hex::encode(digest),
                },
            )
            .is_some();

        if self.is_finalized() {
            return Ok(VoteOutcome::AlreadyFinalized);
        }

        if let Some((winner, count)) = self.plurality(active) {
            if count >= quorum.threshold(active.len()) {
                self.finalized = Some(winner);
                self.finalized_height = Some(height);
                return Ok(VoteOutcome::Finalized);
            }
        }

        Ok(if replaced {
            VoteOutcome::Replaced
        } else {
            VoteOutcome::Recorded
        })
    }

    /// Payload with the most votes from `active` nodes, and its vote count
    pub fn plurality(&self, active: &BTreeSet<NodeId>) -> Option<(ObservedTransfer, usize)> {
        let mut tally: BTreeMap<&str, (usize, &ObservedTransfer)> = BTreeMap::new();
        for (node, vote) in &self.votes {
            if !active.contains(node) {
                continue;
            }
            tally
                .entry(vote.digest.as_str())
                .or_insert((0, &vote.transfer))
                .0 += 1;
        }
        tally
            .into_values()
            .max_by_key(|(count, _)| *count)
            .map(|(count, transfer)| (transfer.clone(), count))
    }

    /// Attach an outbound transfer; false if this outbound was already recorded
    pub fn add_out_tx(&mut self, outbound: ObservedTransfer) -> bool {
        if self.out_txs.iter().any(|o| o.key() == outbound.key()) {
            return false;
        }
        self.out_txs.push(outbound);
        true
    }
}
