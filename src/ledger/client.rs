//! Access to the ledger's transaction and query paths
//!
//! [`LocalLedger`] hosts the state machine in-process and cuts blocks on a
//! timer. [`HttpLedgerClient`] talks to a ledger served by another process
//! through the routes in `api`.

use super::{ApplyOutcome, Ledger, ObservedTxVoter, Quorum, TxOutBlock, VaultAddressSet};
use crate::error::{LedgerError, LedgerResult, NodeError, NodeResult};
use crate::messages::{SignedMessage, SubmitResponse};
use crate::types::{Address, Asset, Chain, NodeId, TxKey};

use async_trait::async_trait;
use ethers::types::Signature;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Deliver a signed message to the transaction path
    async fn submit(&self, msg: SignedMessage) -> NodeResult<SubmitResponse>;

    /// Height currently accepting messages
    async fn height(&self) -> NodeResult<u64>;

    async fn tx_out(&self, height: u64) -> NodeResult<TxOutBlock>;

    async fn vaults(&self) -> NodeResult<VaultAddressSet>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub height: u64,
    pub last_signed_height: u64,
    pub active_nodes: Vec<NodeId>,
    pub quorum: Quorum,
    pub churn_grace_blocks: u64,
    pub admin_sequence: u64,
    pub collected_fees: BTreeMap<Asset, u128>,
    pub gas_spent: BTreeMap<Chain, u128>,
}

/// Check that `signed.signature` was produced by `signed.signer` over the payload bytes
pub fn verify_signature(signed: &SignedMessage) -> LedgerResult<()> {
    let bytes = hex::decode(signed.signature.trim_start_matches("0x"))
        .map_err(|_| LedgerError::BadSignature)?;
    let signature = Signature::try_from(bytes.as_slice()).map_err(|_| LedgerError::BadSignature)?;
    let recovered = signature
        .recover(signed.payload.as_bytes())
        .map_err(|_| LedgerError::BadSignature)?;
    let recovered =
        Address::new(&format!("{:?}", recovered)).map_err(|_| LedgerError::BadSignature)?;
    if recovered != signed.signer {
        return Err(LedgerError::BadSignature);
    }
    Ok(())
}

fn tx_hash(signed: &SignedMessage) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(signed.payload.as_bytes());
    hasher.update(signed.signature.as_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Single-process sequential ledger
pub struct LocalLedger {
    state: Mutex<Ledger>,
}

impl LocalLedger {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            state: Mutex::new(ledger),
        }
    }

    /// Verify, decode and apply one signed message
    pub async fn deliver(
        &self,
        signed: &SignedMessage,
    ) -> LedgerResult<(SubmitResponse, ApplyOutcome)> {
        verify_signature(signed)?;
        let msg = signed
            .decode()
            .map_err(|e| LedgerError::InvalidMessage(e.to_string()))?;
        let mut state = self.state.lock().await;
        let height = state.height();
        let outcome = state.apply(&signed.signer, msg)?;
        Ok((
            SubmitResponse {
                tx_hash: tx_hash(signed),
                height,
            },
            outcome,
        ))
    }

    pub async fn end_block(&self) -> u64 {
        self.state.lock().await.end_block()
    }

    /// Cut a block every `block_time` until cancelled
    pub async fn run(&self, block_time: Duration, cancel: CancellationToken) {
        info!("Local ledger producing blocks every {:?}", block_time);
        let mut ticker = tokio::time::interval(block_time);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let height = self.end_block().await;
                    debug!("Ledger advanced to height {}", height);
                }
            }
        }
        info!("Local ledger stopped");
    }

    pub async fn voter(&self, key: &TxKey) -> Option<ObservedTxVoter> {
        self.state.lock().await.voter(key).cloned()
    }

    pub async fn status(&self) -> LedgerStatus {
        let state = self.state.lock().await;
        LedgerStatus {
            height: state.height(),
            last_signed_height: state.last_signed_height(),
            active_nodes: state.active_nodes().iter().cloned().collect(),
            quorum: state.params().quorum,
            churn_grace_blocks: state.params().churn_grace_blocks,
            admin_sequence: state.admin_sequence(),
            collected_fees: state.collected_fees().clone(),
            gas_spent: state.gas_spent().clone(),
        }
    }
}

#[async_trait]
impl LedgerClient for LocalLedger {
    async fn submit(&self, msg: SignedMessage) -> NodeResult<SubmitResponse> {
        let (response, _) = self.deliver(&msg).await?;
        Ok(response)
    }

    async fn height(&self) -> NodeResult<u64> {
        Ok(self.state.lock().await.height())
    }

    async fn tx_out(&self, height: u64) -> NodeResult<TxOutBlock> {
        Ok(self.state.lock().await.tx_out(height))
    }

    async fn vaults(&self) -> NodeResult<VaultAddressSet> {
        Ok(self.state.lock().await.vaults())
    }
}

/// Client for a ledger served over HTTP
pub struct HttpLedgerClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str, timeout: Duration) -> NodeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> NodeResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| NodeError::LedgerUnavailable(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(NodeError::LedgerUnavailable(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| NodeError::Malformed(format!("GET {}: {}", url, e)))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn submit(&self, msg: SignedMessage) -> NodeResult<SubmitResponse> {
        let url = format!("{}/submit", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&msg)
            .send()
            .await
            .map_err(|e| NodeError::LedgerUnavailable(format!("POST {}: {}", url, e)))?;

        match response.status() {
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| NodeError::Malformed(format!("submit response: {}", e))),
            StatusCode::UNPROCESSABLE_ENTITY => {
                let rejection: LedgerError = response
                    .json()
                    .await
                    .map_err(|e| NodeError::Malformed(format!("rejection body: {}", e)))?;
                Err(NodeError::Rejected(rejection))
            }
            status => {
                warn!("Ledger answered {} to submission", status);
                Err(NodeError::LedgerUnavailable(format!(
                    "POST {} returned {}",
                    url, status
                )))
            }
        }
    }

    async fn height(&self) -> NodeResult<u64> {
        let status: LedgerStatus = self.get("/height").await?;
        Ok(status.height)
    }

    async fn tx_out(&self, height: u64) -> NodeResult<TxOutBlock> {
        self.get(&format!("/txout/{}", height)).await
    }

    async fn vaults(&self) -> NodeResult<VaultAddressSet> {
        self.get("/vaults").await
    }
}
