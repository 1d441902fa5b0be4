//! Transaction memo grammar
//!
//! Memos are decoded exactly once, when the chain scanner extracts a transfer.
//! Everything downstream matches on [`Memo`] instead of re-parsing strings.

use crate::error::{NodeError, NodeResult};
use crate::types::{Address, Asset, TxId};

use std::fmt;
use std::str::FromStr;

/// Full withdrawal, in basis points
pub const MAX_WITHDRAW_BASIS_POINTS: u32 = 10_000;

/// Intent carried by an inbound or outbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Memo {
    /// Swap the inbound coin into `asset`, paid to `destination` (sender when absent)
    Swap {
        asset: Asset,
        destination: Option<Address>,
        limit: Option<u128>,
    },
    /// Provide liquidity to the `asset` pool
    Stake {
        asset: Asset,
        address: Option<Address>,
    },
    /// Withdraw a share of liquidity from the `asset` pool
    Withdraw { asset: Asset, basis_points: u32 },
    /// Donate to the `asset` pool
    Add { asset: Asset },
    /// Top up vault gas
    Gas,
    /// Outbound payment settling the named inbound
    Outbound { in_tx: TxId },
    /// Bond for a node account
    Bond { node: Address },
    /// Request the sender's node to leave
    Leave,
    /// Contribution to the protocol reserve
    Reserve,
}

impl Memo {
    /// Short name used for logging and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Memo::Swap { .. } => "swap",
            Memo::Stake { .. } => "stake",
            Memo::Withdraw { .. } => "withdraw",
            Memo::Add { .. } => "add",
            Memo::Gas => "gas",
            Memo::Outbound { .. } => "outbound",
            Memo::Bond { .. } => "bond",
            Memo::Leave => "leave",
            Memo::Reserve => "reserve",
        }
    }

    pub fn is_outbound(&self) -> bool {
        matches!(self, Memo::Outbound { .. })
    }
}

fn invalid(memo: &str, reason: impl Into<String>) -> NodeError {
    NodeError::InvalidMemo {
        memo: memo.to_string(),
        reason: reason.into(),
    }
}

fn required<'a>(memo: &str, parts: &[&'a str], idx: usize, what: &str) -> NodeResult<&'a str> {
    match parts.get(idx) {
        Some(p) if !p.trim().is_empty() => Ok(p.trim()),
        _ => Err(invalid(memo, format!("missing {}", what))),
    }
}

fn optional<'a>(parts: &[&'a str], idx: usize) -> Option<&'a str> {
    parts
        .get(idx)
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
}

impl FromStr for Memo {
    type Err = NodeError;

    fn from_str(memo: &str) -> Result<Self, Self::Err> {
        let trimmed = memo.trim();
        if trimmed.is_empty() {
            return Err(invalid(memo, "empty memo"));
        }
        let parts: Vec<&str> = trimmed.split(':').collect();
        let keyword = parts[0].trim().to_ascii_uppercase();
        let asset = |idx: usize| -> NodeResult<Asset> {
            required(memo, &parts, idx, "asset")?
                .parse()
                .map_err(|e: NodeError| invalid(memo, e.to_string()))
        };
        let address = |raw: Option<&str>| -> NodeResult<Option<Address>> {
            raw.map(|a| Address::new(a).map_err(|e| invalid(memo, e.to_string())))
                .transpose()
        };

        let parsed = match keyword.as_str() {
            "SWAP" | "=" => {
                let limit = optional(&parts, 3)
                    .map(|l| l.parse::<u128>().map_err(|e| invalid(memo, format!("bad limit: {}", e))))
                    .transpose()?;
                Memo::Swap {
                    asset: asset(1)?,
                    destination: address(optional(&parts, 2))?,
                    limit,
                }
            }
            "STAKE" | "+" => Memo::Stake {
                asset: asset(1)?,
                address: address(optional(&parts, 2))?,
            },
            "WITHDRAW" | "-" => {
                let basis_points = match optional(&parts, 2) {
                    Some(bp) => bp
                        .parse::<u32>()
                        .map_err(|e| invalid(memo, format!("bad basis points: {}", e)))?,
                    None => MAX_WITHDRAW_BASIS_POINTS,
                };
                if basis_points == 0 || basis_points > MAX_WITHDRAW_BASIS_POINTS {
                    return Err(invalid(memo, "basis points out of range"));
                }
                Memo::Withdraw {
                    asset: asset(1)?,
                    basis_points,
                }
            }
            "ADD" => Memo::Add { asset: asset(1)? },
            "GAS" => Memo::Gas,
            "OUTBOUND" => {
                let raw = required(memo, &parts, 1, "inbound tx id")?;
                Memo::Outbound {
                    in_tx: TxId::new(raw).map_err(|e| invalid(memo, e.to_string()))?,
                }
            }
            "BOND" => {
                let raw = required(memo, &parts, 1, "node address")?;
                Memo::Bond {
                    node: Address::new(raw).map_err(|e| invalid(memo, e.to_string()))?,
                }
            }
            "LEAVE" => Memo::Leave,
            "RESERVE" => Memo::Reserve,
            other => return Err(invalid(memo, format!("unknown memo type {}", other))),
        };
        Ok(parsed)
    }
}

impl fmt::Display for Memo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Memo::Swap {
                asset,
                destination,
                limit,
            } => {
                write!(f, "SWAP:{}", asset)?;
                match (destination, limit) {
                    (Some(d), Some(l)) => write!(f, ":{}:{}", d, l),
                    (Some(d), None) => write!(f, ":{}", d),
                    (None, Some(l)) => write!(f, "::{}", l),
                    (None, None) => Ok(()),
                }
            }
            Memo::Stake { asset, address } => match address {
                Some(a) => write!(f, "STAKE:{}:{}", asset, a),
                None => write!(f, "STAKE:{}", asset),
            },
            Memo::Withdraw {
                asset,
                basis_points,
            } => write!(f, "WITHDRAW:{}:{}", asset, basis_points),
            Memo::Add { asset } => write!(f, "ADD:{}", asset),
            Memo::Gas => f.write_str("GAS"),
            Memo::Outbound { in_tx } => write!(f, "OUTBOUND:{}", in_tx),
            Memo::Bond { node } => write!(f, "BOND:{}", node),
            Memo::Leave => f.write_str("LEAVE"),
            Memo::Reserve => f.write_str("RESERVE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_swap() {
        let memo: Memo = "SWAP:ETH.USDT".parse().unwrap();
        match memo {
            Memo::Swap {
                asset,
                destination,
                limit,
            } => {
                assert_eq!(asset.to_string(), "ETH.USDT");
                assert!(destination.is_none());
                assert!(limit.is_none());
            }
            other => panic!("unexpected memo {:?}", other),
        }

        let memo: Memo = "=:bnb.bnb:bnb1dest:1000".parse().unwrap();
        assert_eq!(memo.to_string(), "SWAP:BNB.BNB:bnb1dest:1000");

        let memo: Memo = "swap:ETH.ETH::25".parse().unwrap();
        assert_eq!(
            memo,
            Memo::Swap {
                asset: "ETH.ETH".parse().unwrap(),
                destination: None,
                limit: Some(25),
            }
        );
    }

    #[test]
    fn test_parse_withdraw_defaults_to_full() {
        let memo: Memo = "WITHDRAW:ETH.ETH".parse().unwrap();
        assert_eq!(
            memo,
            Memo::Withdraw {
                asset: "ETH.ETH".parse().unwrap(),
                basis_points: MAX_WITHDRAW_BASIS_POINTS,
            }
        );
        assert!("WITHDRAW:ETH.ETH:0".parse::<Memo>().is_err());
        assert!("WITHDRAW:ETH.ETH:10001".parse::<Memo>().is_err());
    }

    #[test]
    fn test_parse_outbound() {
        let memo: Memo = "OUTBOUND:0xdeadbeef".parse().unwrap();
        assert_eq!(
            memo,
            Memo::Outbound {
                in_tx: TxId::new("DEADBEEF").unwrap()
            }
        );
        assert!(memo.is_outbound());
        assert!("OUTBOUND:".parse::<Memo>().is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "   ", "HELLO", "SWAP", "SWAP:ETH", "STAKE:", "SWAP:ETH.ETH:dest:notanumber"] {
            let err = bad.parse::<Memo>().unwrap_err();
            assert!(matches!(err, NodeError::InvalidMemo { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_simple_keywords() {
        assert_eq!("gas".parse::<Memo>().unwrap(), Memo::Gas);
        assert_eq!("LEAVE".parse::<Memo>().unwrap(), Memo::Leave);
        assert_eq!("reserve".parse::<Memo>().unwrap().kind(), "reserve");
    }
}
