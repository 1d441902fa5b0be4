//! Replicated ledger state machine
//!
//! Applies signed observations in order, aggregates votes per external
//! transaction, schedules outbound payments for finalized inbounds, and
//! correlates observed outbounds back to the payments they settle.

pub mod client;
pub mod gas;
pub mod handler;
pub mod txout;
pub mod vaults;
pub mod voter;

pub use client::{HttpLedgerClient, LedgerClient, LocalLedger};
pub use txout::{TxOutBlock, TxOutItem};
pub use vaults::{VaultAddress, VaultAddressSet, VaultManager};
pub use voter::{ObservedTxVoter, Quorum, VoteOutcome};

use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult, NodeError, NodeResult};
use crate::memo::Memo;
use crate::messages::{ChurnProposal, LedgerMsg, OutboundObservation, ParamChange};
use crate::metrics::Metrics;
use crate::types::{Address, Asset, Chain, Coin, Coins, NodeId, ObservedTransfer, PubKey, TxId, TxKey};

use gas::{FeeOutcome, GasManager};
use handler::{FixedRatePricing, Payment, Pricing};
use txout::TxOutStore;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Network tunables; set at genesis, changed later by admin messages
#[derive(Debug, Clone)]
pub struct LedgerParams {
    pub quorum: Quorum,
    pub churn_grace_blocks: u64,
    pub network_fees: HashMap<Chain, u128>,
    pub admins: BTreeSet<NodeId>,
}

impl LedgerParams {
    pub fn from_config(config: &LedgerConfig) -> NodeResult<Self> {
        let mut network_fees = HashMap::new();
        for (chain, fee) in &config.network_fees {
            network_fees.insert(Chain::new(chain)?, u128::from(*fee));
        }
        let admins = config
            .admin_nodes
            .iter()
            .map(|n| Address::new(n))
            .collect::<NodeResult<BTreeSet<_>>>()?;
        Ok(Self {
            quorum: Quorum {
                numerator: config.quorum_numerator,
                denominator: config.quorum_denominator,
            },
            churn_grace_blocks: config.churn_grace_blocks,
            network_fees,
            admins,
        })
    }
}

/// Result of applying one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Vote { outcome: VoteOutcome, scheduled: usize },
    Outbound { settled: usize },
    Admin { sequence: u64 },
}

pub struct Ledger {
    height: u64,
    params: LedgerParams,
    nodes: BTreeSet<NodeId>,
    voters: BTreeMap<TxKey, ObservedTxVoter>,
    /// Finalized inbound id to its voter key, for outbound correlation
    finalized_index: HashMap<TxId, TxKey>,
    vaults: VaultManager,
    txout: TxOutStore,
    gas: GasManager,
    pricing: Box<dyn Pricing>,
    last_chain_heights: BTreeMap<Chain, u64>,
    last_signed_height: u64,
    /// Sequence of the last applied admin message
    admin_sequence: u64,
    metrics: Arc<Metrics>,
}

impl Ledger {
    pub fn new(
        params: LedgerParams,
        nodes: BTreeSet<NodeId>,
        genesis_vaults: Vec<VaultAddress>,
        pricing: Box<dyn Pricing>,
        metrics: Arc<Metrics>,
    ) -> LedgerResult<Self> {
        let vaults = VaultManager::new(genesis_vaults, params.churn_grace_blocks)?;
        let gas = GasManager::new(params.network_fees.clone());
        Ok(Self {
            height: 1,
            params,
            nodes,
            voters: BTreeMap::new(),
            finalized_index: HashMap::new(),
            vaults,
            txout: TxOutStore::new(),
            gas,
            pricing,
            last_chain_heights: BTreeMap::new(),
            last_signed_height: 0,
            admin_sequence: 0,
            metrics,
        })
    }

    /// Build the genesis state described by the `[ledger]` config section
    pub fn from_config(config: &LedgerConfig, metrics: Arc<Metrics>) -> NodeResult<Self> {
        let params = LedgerParams::from_config(config)?;
        let nodes = config
            .active_nodes
            .iter()
            .map(|n| Address::new(n))
            .collect::<NodeResult<BTreeSet<_>>>()?;
        let vaults = config
            .vaults
            .iter()
            .map(|v| {
                Ok::<_, NodeError>(VaultAddress {
                    chain: Chain::new(&v.chain)?,
                    pub_key: PubKey::new(&v.pub_key)?,
                    address: Address::new(&v.address)?,
                })
            })
            .collect::<NodeResult<Vec<_>>>()?;
        let pricing = FixedRatePricing::from_config(&config.rates)?;
        info!(
            "Ledger genesis: {} active nodes, {} vaults, quorum {}/{}",
            nodes.len(),
            vaults.len(),
            params.quorum.numerator,
            params.quorum.denominator
        );
        Ok(Self::new(params, nodes, vaults, Box::new(pricing), metrics)?)
    }

    /// Height currently accepting messages
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Close the current height and open the next
    pub fn end_block(&mut self) -> u64 {
        self.txout.seal(self.height);
        self.height += 1;
        self.height
    }

    pub fn apply(&mut self, signer: &NodeId, msg: LedgerMsg) -> LedgerResult<ApplyOutcome> {
        if msg.transfer().is_some() && !self.nodes.contains(signer) {
            return Err(LedgerError::UnauthorizedSigner(signer.to_string()));
        }
        match msg {
            LedgerMsg::Observation(transfer) => self.apply_observation(signer, transfer),
            LedgerMsg::OutboundObservation(observation) => self.apply_outbound(observation),
            LedgerMsg::Churn(proposal) => {
                self.check_admin(signer, proposal.sequence)?;
                self.apply_churn(proposal)
            }
            LedgerMsg::SetParams(change) => {
                self.check_admin(signer, change.sequence)?;
                self.apply_params(change)
            }
        }
    }

    fn check_admin(&self, signer: &NodeId, sequence: u64) -> LedgerResult<()> {
        if !self.params.admins.contains(signer) {
            return Err(LedgerError::UnauthorizedAdmin(signer.to_string()));
        }
        if sequence != self.admin_sequence + 1 {
            return Err(LedgerError::StaleSequence {
                current: self.admin_sequence,
                proposed: sequence,
            });
        }
        Ok(())
    }

    /// Install a new node set and vault generation at the current height
    fn apply_churn(&mut self, proposal: ChurnProposal) -> LedgerResult<ApplyOutcome> {
        let nodes: BTreeSet<NodeId> = proposal.nodes.into_iter().collect();
        if nodes.is_empty() {
            return Err(LedgerError::InvalidMessage(
                "churn must leave at least one active node".to_string(),
            ));
        }
        self.vaults.churn(self.height, proposal.vaults)?;
        info!(
            "Active node set changed at height {}: {} -> {} nodes",
            self.height,
            self.nodes.len(),
            nodes.len()
        );
        self.nodes = nodes;
        self.admin_sequence = proposal.sequence;
        Ok(ApplyOutcome::Admin {
            sequence: proposal.sequence,
        })
    }

    fn apply_params(&mut self, change: ParamChange) -> LedgerResult<ApplyOutcome> {
        if let Some(quorum) = change.quorum {
            if !quorum.is_valid() {
                return Err(LedgerError::InvalidMessage(format!(
                    "quorum {}/{} is not a strict majority",
                    quorum.numerator, quorum.denominator
                )));
            }
        }

        if let Some(quorum) = change.quorum {
            info!("Quorum set to {}/{}", quorum.numerator, quorum.denominator);
            self.params.quorum = quorum;
        }
        if let Some(blocks) = change.churn_grace_blocks {
            self.params.churn_grace_blocks = blocks;
            self.vaults.set_grace_window(blocks);
            info!("Churn grace window set to {} blocks", self.vaults.grace_window());
        }
        for (chain, fee) in change.network_fees {
            let fee = u128::from(fee);
            info!("Network fee on {} set to {}", chain, fee);
            self.gas.set_network_fee(&chain, fee);
            self.params.network_fees.insert(chain, fee);
        }
        self.admin_sequence = change.sequence;
        Ok(ApplyOutcome::Admin {
            sequence: change.sequence,
        })
    }

    fn apply_observation(
        &mut self,
        signer: &NodeId,
        transfer: ObservedTransfer,
    ) -> LedgerResult<ApplyOutcome> {
        let memo: Memo = transfer
            .memo
            .parse()
            .map_err(|e: NodeError| LedgerError::InvalidMessage(e.to_string()))?;
        if memo.is_outbound() {
            return Err(LedgerError::InvalidMessage(
                "outbound memo must be reported as an outbound observation".to_string(),
            ));
        }
        if transfer.coins.is_empty() {
            return Err(LedgerError::InvalidMessage(format!(
                "{} carries no coins",
                transfer.key()
            )));
        }
        if !self
            .vaults
            .is_authorized(&transfer.chain, &transfer.to, self.height)
        {
            return Err(LedgerError::UnauthorizedVault {
                chain: transfer.chain.to_string(),
                address: transfer.to.to_string(),
            });
        }

        let key = transfer.key();
        let height = self.height;
        let outcome = self
            .voters
            .entry(key.clone())
            .or_insert_with(|| ObservedTxVoter::new(key.clone()))
            .add_vote(signer, transfer, height, &self.nodes, self.params.quorum)?;
        self.metrics.record_vote(outcome.as_str());

        let mut scheduled = 0;
        if outcome == VoteOutcome::Finalized {
            let finalized = self
                .voters
                .get(&key)
                .and_then(|v| v.finalized.clone())
                .ok_or_else(|| LedgerError::UnknownVoter(key.to_string()))?;
            let finalized_memo: Memo = finalized
                .memo
                .parse()
                .map_err(|e: NodeError| LedgerError::InvalidMessage(e.to_string()))?;
            scheduled = self.finalize(&finalized_memo, &finalized)?;
            if let Some(voter) = self.voters.get_mut(&key) {
                voter.expected_out = scheduled;
            }
            self.finalized_index.insert(key.tx_id.clone(), key.clone());
        }
        debug!("Vote from {} on {}: {:?}", signer, key, outcome);
        Ok(ApplyOutcome::Vote { outcome, scheduled })
    }

    /// Run the memo handler on a finalized payload and queue its payments
    fn finalize(&mut self, memo: &Memo, transfer: &ObservedTransfer) -> LedgerResult<usize> {
        if let Err(e) = self.set_last_chain_height(&transfer.chain, transfer.block_height) {
            warn!("Finalizing {}: {}", transfer.key(), e);
        }
        self.metrics
            .record_finalized(transfer.chain.as_str(), memo.kind());
        info!(
            "Observation {} finalized at height {} ({})",
            transfer.key(),
            self.height,
            memo.kind()
        );

        let payments = handler::handle(memo, transfer, self.pricing.as_mut())?;
        let items = match self.price_payments(transfer, payments.clone()) {
            Some(items) => items,
            None => {
                // a payment could not be made, so the whole inbound goes back
                if let Memo::Withdraw { asset, .. } = memo {
                    let withdrawn = Coins::new(payments.into_iter().map(|p| p.coin).collect());
                    self.pricing.deposit(&transfer.from, asset, &withdrawn)?;
                }
                self.price_payments(transfer, handler::refund(transfer))
                    .unwrap_or_default()
            }
        };

        let count = items.len();
        for (item, fee) in items {
            if let Some(fee) = &fee {
                self.gas.record_collected(fee);
            }
            self.metrics.record_txout_item(item.chain.as_str());
            self.txout.add_tx_out_item(self.height, item)?;
        }
        Ok(count)
    }

    /// Assign vaults and withhold fees. `None` when a non-refund payment is below its
    /// fee or has no vault to pay from.
    fn price_payments(
        &self,
        transfer: &ObservedTransfer,
        payments: Vec<Payment>,
    ) -> Option<Vec<(TxOutItem, Option<Coin>)>> {
        let mut items = Vec::new();
        for payment in payments {
            let (coin, fee) = match self.gas.apply_fee(&payment.coin) {
                FeeOutcome::Payable { coin, fee } => (coin, fee),
                FeeOutcome::BelowFloor { fee } if payment.refund => {
                    info!(
                        "Refund of {} for {} does not cover fee {}, kept as dust",
                        payment.coin,
                        transfer.tx_id,
                        fee
                    );
                    continue;
                }
                FeeOutcome::BelowFloor { fee } => {
                    info!(
                        "Payment of {} for {} does not cover fee {}",
                        payment.coin, transfer.tx_id, fee
                    );
                    return None;
                }
            };
            let Some(vault) = self.vaults.authorized_vault(&payment.chain, self.height) else {
                if payment.refund {
                    error!(
                        "No vault on {} to refund {} for {}",
                        payment.chain, payment.coin, transfer.tx_id
                    );
                    continue;
                }
                info!(
                    "No vault on {} to pay {} for {}",
                    payment.chain, payment.coin, transfer.tx_id
                );
                return None;
            };
            items.push((
                TxOutItem {
                    chain: payment.chain,
                    in_tx: transfer.tx_id.clone(),
                    vault_pub_key: vault.pub_key.clone(),
                    to: payment.to,
                    coin,
                    memo: Memo::Outbound {
                        in_tx: transfer.tx_id.clone(),
                    }
                    .to_string(),
                    out_tx: None,
                    gas_refund: fee.clone(),
                },
                fee,
            ));
        }
        Some(items)
    }

    fn apply_outbound(&mut self, observation: OutboundObservation) -> LedgerResult<ApplyOutcome> {
        let OutboundObservation { in_tx, outbound } = observation;
        if !self
            .vaults
            .is_authorized(&outbound.chain, &outbound.from, self.height)
        {
            return Err(LedgerError::UnauthorizedVault {
                chain: outbound.chain.to_string(),
                address: outbound.from.to_string(),
            });
        }
        let key = self
            .finalized_index
            .get(&in_tx)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownVoter(in_tx.to_string()))?;
        let voter = self
            .voters
            .get_mut(&key)
            .ok_or_else(|| LedgerError::UnknownVoter(key.to_string()))?;
        let finalized_height = voter
            .finalized_height
            .ok_or_else(|| LedgerError::UnknownVoter(key.to_string()))?;

        let chain = outbound.chain.clone();
        let settled =
            self.txout
                .set_outbound_hash(finalized_height, &in_tx, &outbound.coins, &outbound.tx_id);
        voter.add_out_tx(outbound);
        voter.settled_out += settled;
        let done = voter.is_done();

        if settled > 0 {
            let gas = self.gas.network_fee(&chain) * settled as u128;
            self.gas.add_gas_fees(&chain, gas);
            if let Err(e) = self.set_last_signed_height(finalized_height) {
                warn!("Settling {}: {}", in_tx, e);
            }
            for _ in 0..settled {
                self.metrics.record_outbound_correlated(chain.as_str());
            }
            info!(
                "Outbound for {} settled {} item(s){}",
                in_tx,
                settled,
                if done { ", transaction complete" } else { "" }
            );
        }
        Ok(ApplyOutcome::Outbound { settled })
    }

    /// Raise the last finalized external height of `chain`; never lowers it
    fn set_last_chain_height(&mut self, chain: &Chain, height: u64) -> LedgerResult<()> {
        let current = self.last_chain_heights.entry(chain.clone()).or_insert(0);
        if height < *current {
            return Err(LedgerError::HeightRegression {
                what: format!("{} chain", chain),
                current: *current,
                proposed: height,
            });
        }
        *current = height;
        Ok(())
    }

    fn set_last_signed_height(&mut self, height: u64) -> LedgerResult<()> {
        if height < self.last_signed_height {
            return Err(LedgerError::HeightRegression {
                what: "last signed".to_string(),
                current: self.last_signed_height,
                proposed: height,
            });
        }
        self.last_signed_height = height;
        Ok(())
    }

    pub fn voter(&self, key: &TxKey) -> Option<&ObservedTxVoter> {
        self.voters.get(key)
    }

    pub fn tx_out(&self, height: u64) -> TxOutBlock {
        self.txout.get_tx_out(height)
    }

    pub fn vaults(&self) -> VaultAddressSet {
        self.vaults.vaults_at(self.height)
    }

    pub fn active_nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    pub fn params(&self) -> &LedgerParams {
        &self.params
    }

    pub fn admin_sequence(&self) -> u64 {
        self.admin_sequence
    }

    /// Highest ledger height whose outbound has been observed
    pub fn last_signed_height(&self) -> u64 {
        self.last_signed_height
    }

    /// Highest external block height finalized for `chain`
    pub fn last_chain_height(&self, chain: &Chain) -> u64 {
        self.last_chain_heights.get(chain).copied().unwrap_or(0)
    }

    pub fn collected_fees(&self) -> &BTreeMap<Asset, u128> {
        self.gas.collected()
    }

    /// Gas charged per chain for settled outbounds
    pub fn gas_spent(&self) -> &BTreeMap<Chain, u128> {
        self.gas.spent()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::fixtures::*;
    use handler::RATE_SCALE;

    pub(crate) fn node(i: u8) -> NodeId {
        addr(0x10 + i)
    }

    pub(crate) fn vault_address() -> VaultAddress {
        VaultAddress {
            chain: chain("ETH"),
            pub_key: PubKey::new(addr(0x01).as_str()).unwrap(),
            address: addr(0x01),
        }
    }

    pub(crate) fn ledger_with(nodes: BTreeSet<NodeId>, fee: u128) -> Ledger {
        ledger_with_admins(nodes, BTreeSet::new(), fee)
    }

    pub(crate) fn ledger_with_admins(
        nodes: BTreeSet<NodeId>,
        admins: BTreeSet<NodeId>,
        fee: u128,
    ) -> Ledger {
        let mut network_fees = HashMap::new();
        network_fees.insert(chain("ETH"), fee);
        let params = LedgerParams {
            quorum: Quorum::default(),
            churn_grace_blocks: 100,
            network_fees,
            admins,
        };
        let pricing = FixedRatePricing::new()
            .with_rate(asset("ETH.ETH"), asset("ETH.USDT"), 3_000 * RATE_SCALE)
            .with_rate(asset("ETH.ETH"), asset("BNB.BNB"), 5 * RATE_SCALE);
        Ledger::new(
            params,
            nodes,
            vec![vault_address()],
            Box::new(pricing),
            Arc::new(Metrics::new().unwrap()),
        )
        .unwrap()
    }

    fn four_nodes() -> Ledger {
        ledger_with((1..=4).map(node).collect(), 0)
    }

    fn outbound(in_tx: &str, out_tx: &str, c: Coin) -> LedgerMsg {
        let mut t = transfer(out_tx, 0, &format!("OUTBOUND:{}", in_tx));
        t.from = addr(0x01);
        t.to = addr(0xaa);
        t.coins = Coins::new(vec![c]);
        LedgerMsg::OutboundObservation(OutboundObservation {
            in_tx: TxId::new(in_tx).unwrap(),
            outbound: t,
        })
    }

    #[test]
    fn test_quorum_finalizes_and_schedules_one_item() {
        let mut ledger = four_nodes();
        let t = transfer("0x01", 2, "SWAP:ETH.USDT");
        let msg = LedgerMsg::Observation(t.clone());

        for i in 1..=2 {
            let out = ledger.apply(&node(i), msg.clone()).unwrap();
            assert_eq!(
                out,
                ApplyOutcome::Vote {
                    outcome: VoteOutcome::Recorded,
                    scheduled: 0
                }
            );
        }
        let out = ledger.apply(&node(3), msg.clone()).unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Vote {
                outcome: VoteOutcome::Finalized,
                scheduled: 1
            }
        );
        // the fourth vote is recorded but schedules nothing more
        let out = ledger.apply(&node(4), msg).unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Vote {
                outcome: VoteOutcome::AlreadyFinalized,
                scheduled: 0
            }
        );

        let block = ledger.tx_out(1);
        assert_eq!(block.items.len(), 1);
        assert_eq!(block.items[0].coin, coin("ETH.USDT", 6_000));
        assert_eq!(block.items[0].to, t.from);
        assert_eq!(block.items[0].memo, "OUTBOUND:01");
        assert_eq!(ledger.last_chain_height(&chain("ETH")), 100);
        assert!(!ledger.voter(&t.key()).unwrap().is_done());
    }

    #[test]
    fn test_late_conflicting_vote_changes_nothing() {
        let mut ledger = four_nodes();
        let t = transfer("0x01", 2, "SWAP:ETH.USDT");
        for i in 1..=3 {
            ledger.apply(&node(i), LedgerMsg::Observation(t.clone())).unwrap();
        }

        // the fourth node saw a different amount
        let dissent = transfer("0x01", 3, "SWAP:ETH.USDT");
        let out = ledger
            .apply(&node(4), LedgerMsg::Observation(dissent.clone()))
            .unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Vote {
                outcome: VoteOutcome::AlreadyFinalized,
                scheduled: 0
            }
        );

        let voter = ledger.voter(&t.key()).unwrap();
        assert_eq!(voter.finalized.as_ref(), Some(&t));
        assert_eq!(voter.votes.len(), 4);
        assert_eq!(voter.votes[&node(4)].transfer, dissent);
        assert_eq!(voter.expected_out, 1);
        let block = ledger.tx_out(1);
        assert_eq!(block.items.len(), 1);
        assert_eq!(block.items[0].coin, coin("ETH.USDT", 6_000));
    }

    #[test]
    fn test_unauthorized_signer_rejected() {
        let mut ledger = four_nodes();
        let msg = LedgerMsg::Observation(transfer("0x01", 2, "GAS"));
        assert_eq!(
            ledger.apply(&addr(0x99), msg),
            Err(LedgerError::UnauthorizedSigner(addr(0x99).to_string()))
        );
    }

    #[test]
    fn test_transfer_to_unknown_vault_rejected() {
        let mut ledger = four_nodes();
        let mut t = transfer("0x01", 2, "GAS");
        t.to = addr(0x55);
        assert!(matches!(
            ledger.apply(&node(1), LedgerMsg::Observation(t)),
            Err(LedgerError::UnauthorizedVault { .. })
        ));
    }

    #[test]
    fn test_outbound_memo_as_observation_rejected() {
        let mut ledger = four_nodes();
        let msg = LedgerMsg::Observation(transfer("0x01", 2, "OUTBOUND:02"));
        assert!(matches!(
            ledger.apply(&node(1), msg),
            Err(LedgerError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_outbound_settles_across_heights() {
        let mut ledger = four_nodes();
        let t = transfer("T1", 2, "SWAP:ETH.USDT");
        let msg = LedgerMsg::Observation(t.clone());
        for _ in 1..10 {
            ledger.end_block();
        }
        assert_eq!(ledger.height(), 10);
        for i in 1..=3 {
            ledger.apply(&node(i), msg.clone()).unwrap();
        }
        ledger.end_block();
        ledger.end_block();
        assert_eq!(ledger.height(), 12);

        let out = outbound("T1", "O1", coin("ETH.USDT", 6_000));
        assert_eq!(
            ledger.apply(&node(1), out.clone()).unwrap(),
            ApplyOutcome::Outbound { settled: 1 }
        );
        let item = &ledger.tx_out(10).items[0];
        assert_eq!(item.out_tx, Some(TxId::new("O1").unwrap()));
        assert_eq!(ledger.last_signed_height(), 10);
        assert!(ledger.voter(&t.key()).unwrap().is_done());

        // other nodes report the same outbound: nothing changes
        assert_eq!(
            ledger.apply(&node(2), out).unwrap(),
            ApplyOutcome::Outbound { settled: 0 }
        );
        assert_eq!(ledger.voter(&t.key()).unwrap().out_txs.len(), 1);
    }

    #[test]
    fn test_outbound_for_unknown_inbound() {
        let mut ledger = four_nodes();
        let out = outbound("FF", "O1", coin("ETH.ETH", 1));
        assert!(matches!(
            ledger.apply(&node(1), out),
            Err(LedgerError::UnknownVoter(_))
        ));
    }

    #[test]
    fn test_outbound_from_non_vault_rejected() {
        let mut ledger = four_nodes();
        let mut out = outbound("01", "O1", coin("ETH.ETH", 1));
        if let LedgerMsg::OutboundObservation(o) = &mut out {
            o.outbound.from = addr(0x66);
        }
        assert!(matches!(
            ledger.apply(&node(1), out),
            Err(LedgerError::UnauthorizedVault { .. })
        ));
    }

    #[test]
    fn test_fee_withheld_and_dust_dropped() {
        let nodes: BTreeSet<NodeId> = [node(1)].into_iter().collect();
        let mut ledger = ledger_with(nodes, 10);

        // withdraw of a position smaller than the fee refunds the inbound in full
        let stake = transfer("0x01", 100, "STAKE:ETH.ETH");
        ledger.apply(&node(1), LedgerMsg::Observation(stake)).unwrap();
        let withdraw = transfer("0x02", 50, "WITHDRAW:ETH.ETH:500");
        let out = ledger
            .apply(&node(1), LedgerMsg::Observation(withdraw))
            .unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Vote {
                outcome: VoteOutcome::Finalized,
                scheduled: 1
            }
        );
        let item = &ledger.tx_out(1).items[0];
        assert_eq!(item.coin, coin("ETH.ETH", 40));
        assert_eq!(item.gas_refund, Some(coin("ETH.ETH", 10)));

        // a refund that cannot cover the fee is dropped as dust
        let tiny = transfer("0x03", 5, "SWAP:BNB.BNB");
        let out = ledger.apply(&node(1), LedgerMsg::Observation(tiny)).unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Vote {
                outcome: VoteOutcome::Finalized,
                scheduled: 0
            }
        );
        assert_eq!(ledger.collected_fees().get(&asset("ETH.ETH")), Some(&10));
    }

    #[test]
    fn test_payment_without_vault_refunds_in_full() {
        let nodes: BTreeSet<NodeId> = [node(1)].into_iter().collect();
        let mut ledger = ledger_with(nodes, 0);

        // a BNB payout is priced, but no BNB vault exists to send it
        let t = transfer("0x01", 100, "SWAP:BNB.BNB");
        let out = ledger
            .apply(&node(1), LedgerMsg::Observation(t.clone()))
            .unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Vote {
                outcome: VoteOutcome::Finalized,
                scheduled: 1
            }
        );

        let items = ledger.tx_out(1).items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].chain, chain("ETH"));
        assert_eq!(items[0].coin, coin("ETH.ETH", 100));
        assert_eq!(items[0].to, t.from);
        assert!(!ledger.voter(&t.key()).unwrap().is_done());
    }

    #[test]
    fn test_withdraw_without_vault_restores_position() {
        let nodes: BTreeSet<NodeId> = [node(1)].into_iter().collect();
        let mut ledger = ledger_with_admins(nodes, [admin()].into_iter().collect(), 0);

        let mut stake = transfer("0x01", 100, "STAKE:BNB.BNB");
        stake.coins = Coins::new(vec![coin("ETH.ETH", 100), coin("BNB.BNB", 5)]);
        ledger.apply(&node(1), LedgerMsg::Observation(stake)).unwrap();

        // the BNB share has no vault, so the withdraw is refunded
        let withdraw = transfer("0x02", 1, "WITHDRAW:BNB.BNB:10000");
        ledger
            .apply(&node(1), LedgerMsg::Observation(withdraw.clone()))
            .unwrap();
        let items = ledger.tx_out(1).items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].in_tx, withdraw.tx_id);
        assert_eq!(items[0].coin, coin("ETH.ETH", 1));

        // once a BNB vault exists the untouched position pays out in full
        let bnb_vault = VaultAddress {
            chain: chain("BNB"),
            pub_key: PubKey::new("bnbvault").unwrap(),
            address: addr(0x03),
        };
        ledger.end_block();
        ledger
            .apply(&admin(), churn(1, vec![node(1)], vec![vault_address(), bnb_vault]))
            .unwrap();
        let again = transfer("0x03", 1, "WITHDRAW:BNB.BNB:10000");
        let out = ledger.apply(&node(1), LedgerMsg::Observation(again)).unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Vote {
                outcome: VoteOutcome::Finalized,
                scheduled: 2
            }
        );
        let coins: Vec<Coin> = ledger.tx_out(2).items.into_iter().map(|i| i.coin).collect();
        assert_eq!(coins, vec![coin("ETH.ETH", 100), coin("BNB.BNB", 5)]);
    }

    #[test]
    fn test_chain_height_never_moves_back() {
        let nodes: BTreeSet<NodeId> = [node(1)].into_iter().collect();
        let mut ledger = ledger_with(nodes, 0);

        let mut late = transfer("0x01", 1, "GAS");
        late.block_height = 200;
        ledger.apply(&node(1), LedgerMsg::Observation(late)).unwrap();

        // an older block finalizes after a newer one: accepted, height kept
        let mut early = transfer("0x02", 1, "GAS");
        early.block_height = 150;
        let out = ledger.apply(&node(1), LedgerMsg::Observation(early)).unwrap();
        assert!(matches!(
            out,
            ApplyOutcome::Vote {
                outcome: VoteOutcome::Finalized,
                ..
            }
        ));
        assert_eq!(ledger.last_chain_height(&chain("ETH")), 200);

        assert_eq!(
            ledger.set_last_chain_height(&chain("ETH"), 199),
            Err(LedgerError::HeightRegression {
                what: "ETH chain".to_string(),
                current: 200,
                proposed: 199,
            })
        );
        ledger.set_last_signed_height(7).unwrap();
        assert!(matches!(
            ledger.set_last_signed_height(6),
            Err(LedgerError::HeightRegression { current: 7, .. })
        ));
        assert_eq!(ledger.last_signed_height(), 7);
    }

    fn admin() -> NodeId {
        addr(0x99)
    }

    fn admin_ledger() -> Ledger {
        ledger_with_admins(
            (1..=4).map(node).collect(),
            [admin()].into_iter().collect(),
            0,
        )
    }

    fn churn(sequence: u64, nodes: Vec<NodeId>, vaults: Vec<VaultAddress>) -> LedgerMsg {
        LedgerMsg::Churn(ChurnProposal {
            sequence,
            nodes,
            vaults,
        })
    }

    #[test]
    fn test_churn_keeps_previous_vault_during_grace() {
        let mut ledger = admin_ledger();
        let new_vault = VaultAddress {
            chain: chain("ETH"),
            pub_key: PubKey::new("newvault").unwrap(),
            address: addr(0x02),
        };
        ledger.end_block();
        let out = ledger
            .apply(&admin(), churn(1, (2..=5).map(node).collect(), vec![new_vault]))
            .unwrap();
        assert_eq!(out, ApplyOutcome::Admin { sequence: 1 });
        assert_eq!(ledger.admin_sequence(), 1);

        let set = ledger.vaults();
        assert_eq!(set.rotated_at, 2);
        assert_eq!(set.current[0].address, addr(0x02));
        assert_eq!(set.previous[0].address, addr(0x01));

        // node 1 left the set; node 5 joined
        let msg = LedgerMsg::Observation(transfer("0x01", 2, "GAS"));
        assert_eq!(
            ledger.apply(&node(1), msg.clone()),
            Err(LedgerError::UnauthorizedSigner(node(1).to_string()))
        );
        // inbound to the rotated-out vault still counts
        assert!(ledger.apply(&node(5), msg).is_ok());
    }

    #[test]
    fn test_admin_messages_authorized_and_sequenced() {
        let mut ledger = admin_ledger();
        ledger.end_block();

        // an active node is not an admin
        assert_eq!(
            ledger.apply(&node(1), churn(1, vec![node(1)], vec![])),
            Err(LedgerError::UnauthorizedAdmin(node(1).to_string()))
        );
        assert_eq!(
            ledger.apply(&admin(), churn(2, vec![node(1)], vec![])),
            Err(LedgerError::StaleSequence {
                current: 0,
                proposed: 2
            })
        );
        assert!(matches!(
            ledger.apply(&admin(), churn(1, vec![], vec![])),
            Err(LedgerError::InvalidMessage(_))
        ));
        ledger
            .apply(&admin(), churn(1, vec![node(1)], vec![vault_address()]))
            .unwrap();

        // a replayed proposal is refused
        assert!(matches!(
            ledger.apply(&admin(), churn(1, vec![node(1)], vec![vault_address()])),
            Err(LedgerError::StaleSequence { current: 1, .. })
        ));
        // the admin is not a witness
        assert!(matches!(
            ledger.apply(&admin(), LedgerMsg::Observation(transfer("0x01", 2, "GAS"))),
            Err(LedgerError::UnauthorizedSigner(_))
        ));
    }

    #[test]
    fn test_set_params_changes_quorum_grace_and_fees() {
        let mut ledger = admin_ledger();

        let bad = LedgerMsg::SetParams(ParamChange {
            sequence: 1,
            quorum: Some(Quorum {
                numerator: 1,
                denominator: 2,
            }),
            churn_grace_blocks: None,
            network_fees: BTreeMap::new(),
        });
        assert!(matches!(
            ledger.apply(&admin(), bad),
            Err(LedgerError::InvalidMessage(_))
        ));
        assert_eq!(ledger.admin_sequence(), 0);

        let mut network_fees = BTreeMap::new();
        network_fees.insert(chain("ETH"), 10);
        let change = LedgerMsg::SetParams(ParamChange {
            sequence: 1,
            quorum: Some(Quorum {
                numerator: 1,
                denominator: 1,
            }),
            churn_grace_blocks: Some(5),
            network_fees,
        });
        assert_eq!(
            ledger.apply(&admin(), change).unwrap(),
            ApplyOutcome::Admin { sequence: 1 }
        );
        assert_eq!(ledger.params().churn_grace_blocks, 5);

        assert_eq!(ledger.vaults.grace_window(), 5);

        // unanimity: three of four votes no longer finalize
        let t = transfer("0x01", 100, "SWAP:ETH.USDT");
        for i in 1..=3 {
            ledger.apply(&node(i), LedgerMsg::Observation(t.clone())).unwrap();
        }
        assert!(!ledger.voter(&t.key()).unwrap().is_finalized());
        let out = ledger.apply(&node(4), LedgerMsg::Observation(t)).unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Vote {
                outcome: VoteOutcome::Finalized,
                scheduled: 1
            }
        );
        let item = &ledger.tx_out(1).items[0];
        assert_eq!(item.gas_refund, Some(coin("ETH.USDT", 10)));
    }
}
