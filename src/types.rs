//! Value types shared by the observer pipeline and the ledger
//!
//! Identifiers are validated and normalized once, when they enter the system,
//! so equality checks elsewhere can compare them directly.

use crate::error::{NodeError, NodeResult};

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// External chain symbol, e.g. `ETH` or `BNB`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Chain(String);

impl Chain {
    pub fn new(symbol: &str) -> NodeResult<Self> {
        let symbol = symbol.trim();
        if symbol.is_empty() || symbol.len() > 10 || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(NodeError::Malformed(format!("invalid chain {:?}", symbol)));
        }
        Ok(Self(symbol.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Chain {
    type Err = NodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Chain::new(s)
    }
}

impl TryFrom<String> for Chain {
    type Error = NodeError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Chain::new(&s)
    }
}

impl From<Chain> for String {
    fn from(c: Chain) -> Self {
        c.0
    }
}

/// Asset in `CHAIN.SYMBOL` notation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Asset {
    pub chain: Chain,
    pub symbol: String,
}

impl Asset {
    pub fn new(chain: Chain, symbol: &str) -> NodeResult<Self> {
        let symbol = symbol.trim();
        if symbol.is_empty()
            || !symbol
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(NodeError::Malformed(format!("invalid asset symbol {:?}", symbol)));
        }
        Ok(Self {
            chain,
            symbol: symbol.to_ascii_uppercase(),
        })
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.chain, self.symbol)
    }
}

impl FromStr for Asset {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chain, symbol) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| NodeError::Malformed(format!("asset {:?} is not CHAIN.SYMBOL", s)))?;
        Asset::new(Chain::new(chain)?, symbol)
    }
}

impl TryFrom<String> for Asset {
    type Error = NodeError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Asset> for String {
    fn from(a: Asset) -> Self {
        a.to_string()
    }
}

/// An amount of one asset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub asset: Asset,
    #[serde(with = "amount_codec")]
    pub amount: u128,
}

/// Amounts are written as decimal strings; plain integers are accepted on read
mod amount_codec {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(amount)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        struct AmountVisitor;

        impl<'de> Visitor<'de> for AmountVisitor {
            type Value = u128;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an unsigned amount as a decimal string or integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
                Ok(u128::from(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
                v.parse()
                    .map_err(|_| E::custom(format!("invalid amount {:?}", v)))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

impl Coin {
    pub fn new(asset: Asset, amount: u128) -> Self {
        Self { asset, amount }
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.asset)
    }
}

/// Ordered set of coins moved by one external transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coins(pub Vec<Coin>);

impl Coins {
    pub fn new(coins: Vec<Coin>) -> Self {
        Self(coins)
    }

    /// True if an identical coin (same asset and amount) is present
    pub fn contains(&self, coin: &Coin) -> bool {
        self.0.iter().any(|c| c == coin)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Coin> {
        self.0.iter()
    }
}

fn normalize_identifier(kind: &str, raw: &str) -> NodeResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(NodeError::Malformed(format!("invalid {} {:?}", kind, raw)));
    }
    Ok(trimmed.to_string())
}

/// External transaction hash. Hex ids lose any `0x` prefix and are upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxId(String);

impl TxId {
    pub fn new(raw: &str) -> NodeResult<Self> {
        let raw = raw.trim();
        let raw = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .unwrap_or(raw);
        let id = normalize_identifier("tx id", raw)?;
        Ok(Self(id.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TxId {
    type Err = NodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxId::new(s)
    }
}

impl TryFrom<String> for TxId {
    type Error = NodeError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        TxId::new(&s)
    }
}

impl From<TxId> for String {
    fn from(t: TxId) -> Self {
        t.0
    }
}

/// Address on an external chain. `0x` addresses are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn new(raw: &str) -> NodeResult<Self> {
        let id = normalize_identifier("address", raw)?;
        if id.starts_with("0x") || id.starts_with("0X") {
            if id.len() != 42 || !id[2..].chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(NodeError::Malformed(format!("invalid hex address {:?}", raw)));
            }
            return Ok(Self(id.to_ascii_lowercase()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = NodeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::new(s)
    }
}

impl TryFrom<String> for Address {
    type Error = NodeError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::new(&s)
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.0
    }
}

/// Public key identifying a vault
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PubKey(String);

impl PubKey {
    pub fn new(raw: &str) -> NodeResult<Self> {
        let id = normalize_identifier("pubkey", raw)?;
        Ok(Self(id.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PubKey {
    type Error = NodeError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        PubKey::new(&s)
    }
}

impl From<PubKey> for String {
    fn from(p: PubKey) -> Self {
        p.0
    }
}

/// Identity of a witnessing node: its signing address
pub type NodeId = Address;

/// Identity of one external transaction across the whole network
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxKey {
    pub chain: Chain,
    pub tx_id: TxId,
}

impl TxKey {
    pub fn new(chain: Chain, tx_id: TxId) -> Self {
        Self { chain, tx_id }
    }
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain, self.tx_id)
    }
}

/// A transfer a node witnessed on an external chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservedTransfer {
    pub chain: Chain,
    pub tx_id: TxId,
    pub block_height: u64,
    pub from: Address,
    pub to: Address,
    pub coins: Coins,
    pub memo: String,
    pub observed_vault: PubKey,
}

impl ObservedTransfer {
    pub fn key(&self) -> TxKey {
        TxKey::new(self.chain.clone(), self.tx_id.clone())
    }

    /// Keccak digest of the canonical encoding; votes agree iff digests agree
    pub fn digest(&self) -> NodeResult<[u8; 32]> {
        let bytes = serde_json::to_vec(self)?;
        Ok(Keccak256::digest(&bytes).into())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_identifier_normalization() {
        assert_eq!(TxId::new("0xabcdef").unwrap().as_str(), "ABCDEF");
        assert_eq!(TxId::new("abcdef").unwrap(), TxId::new("0xABCDEF").unwrap());
        assert!(TxId::new("").is_err());
        assert!(TxId::new("ab cd").is_err());

        let upper = Address::new("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap();
        assert_eq!(upper.as_str(), "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert!(Address::new("0x1234").is_err());
        assert!(Address::new("bnb1qqqq").is_ok());
    }

    #[test]
    fn test_asset_parsing() {
        let a: Asset = "eth.usdt".parse().unwrap();
        assert_eq!(a.chain.as_str(), "ETH");
        assert_eq!(a.symbol, "USDT");
        assert_eq!(a.to_string(), "ETH.USDT");
        assert!("ETH".parse::<Asset>().is_err());
    }

    #[test]
    fn test_coins_contains_requires_exact_amount() {
        let coins = Coins::new(vec![coin("ETH.ETH", 40), coin("ETH.USDT", 7)]);
        assert!(coins.contains(&coin("ETH.ETH", 40)));
        assert!(!coins.contains(&coin("ETH.ETH", 41)));
        assert!(!coins.contains(&coin("BNB.BNB", 40)));
    }

    #[test]
    fn test_digest_distinguishes_payloads() {
        let a = transfer("0x01", 100, "SWAP:ETH.USDT");
        let b = transfer("0x01", 100, "SWAP:ETH.USDT");
        let c = transfer("0x01", 100, "SWAP:ETH.USDC");
        assert_eq!(a.digest().unwrap(), b.digest().unwrap());
        assert_ne!(a.digest().unwrap(), c.digest().unwrap());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{"memo":"GAS","extra":1,"chain":"ETH","tx_id":"0x01","block_height":5,
            "from":"bnb1from","to":"bnb1to","coins":[{"asset":"ETH.ETH","amount":3}],
            "observed_vault":"vault1"}"#;
        let t: ObservedTransfer = serde_json::from_str(json).unwrap();
        assert_eq!(t.tx_id.as_str(), "01");
        assert_eq!(t.coins.len(), 1);
    }

    #[test]
    fn test_amount_keeps_full_range() {
        let big = coin("ETH.ETH", u128::MAX);
        let json = serde_json::to_string(&big).unwrap();
        assert!(json.contains(&format!("\"{}\"", u128::MAX)));
        assert_eq!(serde_json::from_str::<Coin>(&json).unwrap(), big);

        let numeric: Coin = serde_json::from_str(r#"{"asset":"ETH.ETH","amount":7}"#).unwrap();
        assert_eq!(numeric.amount, 7);
        assert!(serde_json::from_str::<Coin>(r#"{"asset":"ETH.ETH","amount":"-1"}"#).is_err());
    }
}
