//! Wire messages submitted by observer nodes to the ledger
//!
//! Messages are JSON. Field order is irrelevant and unknown fields are ignored,
//! so newer nodes can add fields without breaking older ledgers.

use crate::error::{NodeError, NodeResult};
use crate::ledger::{Quorum, VaultAddress};
use crate::memo::Memo;
use crate::types::{Chain, NodeId, ObservedTransfer, TxId, TxKey};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An outbound payment seen on an external chain, tied to the inbound it settles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundObservation {
    pub in_tx: TxId,
    pub outbound: ObservedTransfer,
}

/// Admin rotation: a new active node set and a new vault generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChurnProposal {
    /// Must be exactly one past the ledger's last admin sequence
    pub sequence: u64,
    pub nodes: Vec<NodeId>,
    pub vaults: Vec<VaultAddress>,
}

/// Admin override of network parameters; absent fields keep their value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamChange {
    pub sequence: u64,
    pub quorum: Option<Quorum>,
    pub churn_grace_blocks: Option<u64>,
    #[serde(default)]
    pub network_fees: BTreeMap<Chain, u64>,
}

/// Message applied by the ledger's transaction path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerMsg {
    Observation(ObservedTransfer),
    OutboundObservation(OutboundObservation),
    Churn(ChurnProposal),
    SetParams(ParamChange),
}

impl LedgerMsg {
    /// Build the message for a transfer whose memo has already been decoded
    pub fn from_transfer(transfer: ObservedTransfer, memo: &Memo) -> Self {
        match memo {
            Memo::Outbound { in_tx } => LedgerMsg::OutboundObservation(OutboundObservation {
                in_tx: in_tx.clone(),
                outbound: transfer,
            }),
            _ => LedgerMsg::Observation(transfer),
        }
    }

    /// External transaction this message reports; admin messages report none
    pub fn transfer(&self) -> Option<&ObservedTransfer> {
        match self {
            LedgerMsg::Observation(t) => Some(t),
            LedgerMsg::OutboundObservation(o) => Some(&o.outbound),
            LedgerMsg::Churn(_) | LedgerMsg::SetParams(_) => None,
        }
    }

    pub fn key(&self) -> Option<TxKey> {
        self.transfer().map(ObservedTransfer::key)
    }

    pub fn name(&self) -> &'static str {
        match self {
            LedgerMsg::Observation(_) => "observation",
            LedgerMsg::OutboundObservation(_) => "outbound_observation",
            LedgerMsg::Churn(_) => "churn",
            LedgerMsg::SetParams(_) => "set_params",
        }
    }

    pub fn encode(&self) -> NodeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A ledger message together with the submitting node's signature over it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub signer: NodeId,
    /// JSON encoding of a [`LedgerMsg`]; the signature covers these exact bytes
    pub payload: String,
    /// Hex-encoded 65-byte recoverable signature
    pub signature: String,
}

impl SignedMessage {
    pub fn decode(&self) -> NodeResult<LedgerMsg> {
        serde_json::from_str(&self.payload)
            .map_err(|e| NodeError::Malformed(format!("undecodable ledger message: {}", e)))
    }
}

/// Ledger's answer to an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub tx_hash: String,
    pub height: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::*;

    #[test]
    fn test_outbound_memo_builds_outbound_observation() {
        let transfer = transfer("0x02", 40, "OUTBOUND:0x01");
        let memo: Memo = transfer.memo.parse().unwrap();
        let msg = LedgerMsg::from_transfer(transfer.clone(), &memo);
        match &msg {
            LedgerMsg::OutboundObservation(o) => {
                assert_eq!(o.in_tx, TxId::new("01").unwrap());
                assert_eq!(o.outbound, transfer);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(msg.key(), Some(transfer.key()));
    }

    #[test]
    fn test_messages_with_coins_decode() {
        let observation = LedgerMsg::Observation(transfer("0x01", 100, "SWAP:ETH.USDT"));
        let decoded: LedgerMsg = serde_json::from_str(&observation.encode().unwrap()).unwrap();
        assert_eq!(decoded, observation);

        let mut out = transfer("0x02", u128::from(u64::MAX) + 1, "OUTBOUND:0x01");
        out.coins.0.push(coin("ETH.USDT", 6_000));
        let memo: Memo = out.memo.parse().unwrap();
        let outbound = LedgerMsg::from_transfer(out, &memo);
        let signed = SignedMessage {
            signer: addr(0x10),
            payload: outbound.encode().unwrap(),
            signature: String::new(),
        };
        assert_eq!(signed.decode().unwrap(), outbound);
    }

    #[test]
    fn test_admin_messages_decode() {
        let churn = LedgerMsg::Churn(ChurnProposal {
            sequence: 1,
            nodes: vec![addr(0x10), addr(0x11)],
            vaults: vec![VaultAddress {
                chain: chain("ETH"),
                pub_key: crate::types::PubKey::new("vault2").unwrap(),
                address: addr(0x02),
            }],
        });
        let decoded: LedgerMsg = serde_json::from_str(&churn.encode().unwrap()).unwrap();
        assert_eq!(decoded, churn);
        assert_eq!(decoded.key(), None);

        let json = r#"{"type":"set_params","sequence":2,"churn_grace_blocks":50}"#;
        match serde_json::from_str::<LedgerMsg>(json).unwrap() {
            LedgerMsg::SetParams(change) => {
                assert_eq!(change.churn_grace_blocks, Some(50));
                assert_eq!(change.quorum, None);
                assert!(change.network_fees.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_field_order_and_unknown_fields() {
        let json = r#"{
            "outbound": {"observed_vault":"vault","memo":"OUTBOUND:01","to":"bnb1to",
                "from":"bnb1from","coins":[],"block_height":12,"tx_id":"02","chain":"BNB",
                "future_field":true},
            "in_tx": "01",
            "type": "outbound_observation",
            "added_later": [1,2,3]
        }"#;
        let msg: LedgerMsg = serde_json::from_str(json).unwrap();
        assert_eq!(msg.name(), "outbound_observation");
        assert_eq!(msg.transfer().unwrap().block_height, 12);

        let encoded = msg.encode().unwrap();
        let decoded: LedgerMsg = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }
}
