//! Turns a finalized observation into outbound payments
//!
//! Dispatch is an exhaustive match over [`Memo`]; adding a memo variant does
//! not compile until every handler here decides what it owes.

use crate::error::{LedgerError, LedgerResult};
use crate::memo::{Memo, MAX_WITHDRAW_BASIS_POINTS};
use crate::types::{Address, Asset, Chain, Coin, Coins, ObservedTransfer};

use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Scale of configured conversion rates
pub const RATE_SCALE: u128 = 100_000_000;

/// Pool-side computations the handler delegates to
pub trait Pricing: Send + Sync {
    /// Amount of `target` paid for `input`
    fn swap_output(&self, input: &Coin, target: &Asset) -> LedgerResult<u128>;

    /// Credit `coins` to `owner`'s position in the `pool` pool
    fn deposit(&mut self, owner: &Address, pool: &Asset, coins: &Coins) -> LedgerResult<()>;

    /// Debit `basis_points` of `owner`'s position in the `pool` pool
    fn withdraw(&mut self, owner: &Address, pool: &Asset, basis_points: u32) -> LedgerResult<Vec<Coin>>;
}

/// Constant-rate pricing with a per-owner deposit book
#[derive(Debug, Default)]
pub struct FixedRatePricing {
    rates: HashMap<(Asset, Asset), u128>,
    positions: HashMap<(Address, Asset), Vec<Coin>>,
}

impl FixedRatePricing {
    pub fn new() -> Self {
        Self::default()
    }

    /// `rate` is the amount of `to` per unit of `from`, scaled by [`RATE_SCALE`]
    pub fn with_rate(mut self, from: Asset, to: Asset, rate: u128) -> Self {
        self.rates.insert((from, to), rate);
        self
    }

    /// Parse `FROM->TO = rate` entries
    pub fn from_config(rates: &HashMap<String, u64>) -> LedgerResult<Self> {
        let mut pricing = Self::new();
        for (pair, rate) in rates {
            let (from, to) = pair.split_once("->").ok_or_else(|| {
                LedgerError::InvalidMessage(format!("rate key {:?} is not FROM->TO", pair))
            })?;
            let parse = |s: &str| {
                s.parse::<Asset>()
                    .map_err(|e| LedgerError::InvalidMessage(e.to_string()))
            };
            pricing = pricing.with_rate(parse(from)?, parse(to)?, u128::from(*rate));
        }
        Ok(pricing)
    }
}

impl Pricing for FixedRatePricing {
    fn swap_output(&self, input: &Coin, target: &Asset) -> LedgerResult<u128> {
        let rate = self
            .rates
            .get(&(input.asset.clone(), target.clone()))
            .ok_or_else(|| {
                LedgerError::InvalidMessage(format!("no rate from {} to {}", input.asset, target))
            })?;
        input
            .amount
            .checked_mul(*rate)
            .map(|v| v / RATE_SCALE)
            .ok_or_else(|| LedgerError::InvalidMessage("swap output overflows".to_string()))
    }

    fn deposit(&mut self, owner: &Address, pool: &Asset, coins: &Coins) -> LedgerResult<()> {
        let position = self
            .positions
            .entry((owner.clone(), pool.clone()))
            .or_default();
        for coin in coins.iter() {
            match position.iter_mut().find(|c| c.asset == coin.asset) {
                Some(held) => held.amount = held.amount.saturating_add(coin.amount),
                None => position.push(coin.clone()),
            }
        }
        Ok(())
    }

    fn withdraw(&mut self, owner: &Address, pool: &Asset, basis_points: u32) -> LedgerResult<Vec<Coin>> {
        let key = (owner.clone(), pool.clone());
        let position = self.positions.get_mut(&key).ok_or_else(|| {
            LedgerError::InvalidMessage(format!("{} has no position in {}", owner, pool))
        })?;
        let bps = u128::from(basis_points.min(MAX_WITHDRAW_BASIS_POINTS));
        let mut out = Vec::new();
        for held in position.iter_mut() {
            let share = held.amount * bps / u128::from(MAX_WITHDRAW_BASIS_POINTS);
            if share > 0 {
                held.amount -= share;
                out.push(Coin::new(held.asset.clone(), share));
            }
        }
        position.retain(|c| !c.is_zero());
        if position.is_empty() {
            self.positions.remove(&key);
        }
        Ok(out)
    }
}

/// A payment the handler wants made, before vault assignment and fees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub chain: Chain,
    pub to: Address,
    pub coin: Coin,
    /// Returning the inbound; a refund that cannot cover its fee is dropped
    pub refund: bool,
}

/// Refund every inbound coin to its sender
pub fn refund(transfer: &ObservedTransfer) -> Vec<Payment> {
    transfer
        .coins
        .iter()
        .filter(|c| !c.is_zero())
        .map(|c| Payment {
            chain: c.asset.chain.clone(),
            to: transfer.from.clone(),
            coin: c.clone(),
            refund: true,
        })
        .collect()
}

/// Payments owed for a finalized inbound carrying `memo`
pub fn handle(
    memo: &Memo,
    transfer: &ObservedTransfer,
    pricing: &mut dyn Pricing,
) -> LedgerResult<Vec<Payment>> {
    match memo {
        Memo::Swap {
            asset,
            destination,
            limit,
        } => Ok(handle_swap(transfer, asset, destination.as_ref(), *limit, pricing)),
        Memo::Stake { asset, address } => {
            let owner = address.as_ref().unwrap_or(&transfer.from);
            match pricing.deposit(owner, asset, &transfer.coins) {
                Ok(()) => {
                    info!("{} staked {:?} into {}", owner, transfer.coins, asset);
                    Ok(Vec::new())
                }
                Err(e) => {
                    warn!("Stake from {} refunded: {}", transfer.from, e);
                    Ok(refund(transfer))
                }
            }
        }
        Memo::Add { asset } => {
            debug!("Donation of {:?} to {}", transfer.coins, asset);
            Ok(Vec::new())
        }
        Memo::Withdraw {
            asset,
            basis_points,
        } => match pricing.withdraw(&transfer.from, asset, *basis_points) {
            Ok(coins) => Ok(coins
                .into_iter()
                .map(|coin| Payment {
                    chain: coin.asset.chain.clone(),
                    to: transfer.from.clone(),
                    coin,
                    refund: false,
                })
                .collect()),
            Err(e) => {
                warn!("Withdraw by {} refunded: {}", transfer.from, e);
                Ok(refund(transfer))
            }
        },
        Memo::Gas | Memo::Reserve => Ok(Vec::new()),
        Memo::Bond { node } => {
            info!("Bond of {:?} for node {}", transfer.coins, node);
            Ok(Vec::new())
        }
        Memo::Leave => {
            info!("Leave requested by {}", transfer.from);
            Ok(Vec::new())
        }
        Memo::Outbound { .. } => Err(LedgerError::InvalidMessage(
            "outbound memo reported as an inbound observation".to_string(),
        )),
    }
}

fn handle_swap(
    transfer: &ObservedTransfer,
    target: &Asset,
    destination: Option<&Address>,
    limit: Option<u128>,
    pricing: &mut dyn Pricing,
) -> Vec<Payment> {
    let input = match transfer.coins.0.as_slice() {
        [single] => single,
        _ => {
            warn!("Swap {} must carry exactly one coin, refunding", transfer.tx_id);
            return refund(transfer);
        }
    };
    if &input.asset == target {
        warn!("Swap {} targets its own asset, refunding", transfer.tx_id);
        return refund(transfer);
    }
    let amount = match pricing.swap_output(input, target) {
        Ok(amount) => amount,
        Err(e) => {
            warn!("Swap {} refunded: {}", transfer.tx_id, e);
            return refund(transfer);
        }
    };
    if amount == 0 || limit.map_or(false, |l| amount < l) {
        info!(
            "Swap {} output {} below limit {:?}, refunding",
            transfer.tx_id, amount, limit
        );
        return refund(transfer);
    }
    vec![Payment {
        chain: target.chain.clone(),
        to: destination.unwrap_or(&transfer.from).clone(),
        coin: Coin::new(target.clone(), amount),
        refund: false,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::*;

    fn pricing() -> FixedRatePricing {
        // 1 ETH buys 3000 USDT
        FixedRatePricing::new().with_rate(
            asset("ETH.ETH"),
            asset("ETH.USDT"),
            3_000 * RATE_SCALE,
        )
    }

    #[test]
    fn test_swap_pays_sender() {
        let t = transfer("0x01", 2, "SWAP:ETH.USDT");
        let memo: Memo = t.memo.parse().unwrap();
        let payments = handle(&memo, &t, &mut pricing()).unwrap();
        assert_eq!(
            payments,
            vec![Payment {
                chain: chain("ETH"),
                to: t.from.clone(),
                coin: coin("ETH.USDT", 6_000),
                refund: false,
            }]
        );
    }

    #[test]
    fn test_swap_to_destination() {
        let memo = format!("SWAP:ETH.USDT:{}", addr(0x77));
        let t = transfer("0x01", 1, &memo);
        let payments = handle(&memo.parse().unwrap(), &t, &mut pricing()).unwrap();
        assert_eq!(payments[0].to, addr(0x77));
    }

    #[test]
    fn test_swap_below_limit_refunds() {
        let t = transfer("0x01", 1, "SWAP:ETH.USDT::5000");
        let payments = handle(&t.memo.parse().unwrap(), &t, &mut pricing()).unwrap();
        assert_eq!(payments, refund(&t));
        assert!(payments[0].refund);
        assert_eq!(payments[0].coin, coin("ETH.ETH", 1));
    }

    #[test]
    fn test_swap_without_rate_refunds() {
        let t = transfer("0x01", 1, "SWAP:BNB.BNB");
        let payments = handle(&t.memo.parse().unwrap(), &t, &mut pricing()).unwrap();
        assert!(payments.iter().all(|p| p.refund));
    }

    #[test]
    fn test_stake_then_withdraw_half() {
        let mut p = pricing();
        let stake = transfer("0x01", 100, "STAKE:ETH.ETH");
        assert!(handle(&stake.memo.parse().unwrap(), &stake, &mut p)
            .unwrap()
            .is_empty());

        let withdraw = transfer("0x02", 1, "WITHDRAW:ETH.ETH:5000");
        let payments = handle(&withdraw.memo.parse().unwrap(), &withdraw, &mut p).unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].coin, coin("ETH.ETH", 50));
        assert!(!payments[0].refund);
    }

    #[test]
    fn test_withdraw_without_position_refunds() {
        let t = transfer("0x01", 1, "WITHDRAW:ETH.ETH");
        let payments = handle(&t.memo.parse().unwrap(), &t, &mut pricing()).unwrap();
        assert_eq!(payments, refund(&t));
    }

    #[test]
    fn test_memos_without_payments() {
        for memo in ["GAS", "RESERVE", "LEAVE", "ADD:ETH.ETH"] {
            let t = transfer("0x01", 1, memo);
            assert!(handle(&memo.parse().unwrap(), &t, &mut pricing())
                .unwrap()
                .is_empty());
        }
    }

    #[test]
    fn test_rates_from_config() {
        let mut rates = HashMap::new();
        rates.insert("ETH.ETH->ETH.USDT".to_string(), 300_000_000_000u64);
        let p = FixedRatePricing::from_config(&rates).unwrap();
        assert_eq!(
            p.swap_output(&coin("ETH.ETH", 1), &asset("ETH.USDT")).unwrap(),
            3_000
        );

        rates.insert("bogus".to_string(), 1);
        assert!(FixedRatePricing::from_config(&rates).is_err());
    }
}
