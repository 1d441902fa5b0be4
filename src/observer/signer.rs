//! Node signing identity

use crate::error::{NodeError, NodeResult};
use crate::messages::{LedgerMsg, SignedMessage};
use crate::types::{Address, NodeId, PubKey};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};

/// Signs ledger messages on behalf of this node
#[async_trait]
pub trait MessageSigner: Send + Sync {
    fn node_id(&self) -> NodeId;

    async fn sign(&self, msg: &LedgerMsg) -> NodeResult<SignedMessage>;
}

/// secp256k1 signer backed by a local key
#[derive(Clone)]
pub struct WalletSigner {
    wallet: LocalWallet,
    node_id: NodeId,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet) -> NodeResult<Self> {
        let node_id = Address::new(&format!("{:?}", wallet.address()))?;
        Ok(Self { wallet, node_id })
    }

    pub fn from_hex(private_key: &str) -> NodeResult<Self> {
        let wallet: LocalWallet = private_key
            .trim()
            .parse()
            .map_err(|e| NodeError::Config(format!("invalid private key: {}", e)))?;
        Self::new(wallet)
    }

    /// Load the key from the named environment variable
    pub fn from_env(var: &str) -> NodeResult<Self> {
        let key = std::env::var(var)
            .map_err(|_| NodeError::Config(format!("environment variable {} is not set", var)))?;
        Self::from_hex(&key)
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    /// Vault key this node's wallet controls
    pub fn vault_pub_key(&self) -> NodeResult<PubKey> {
        PubKey::new(self.node_id.as_str())
    }
}

#[async_trait]
impl MessageSigner for WalletSigner {
    fn node_id(&self) -> NodeId {
        self.node_id.clone()
    }

    async fn sign(&self, msg: &LedgerMsg) -> NodeResult<SignedMessage> {
        let payload = msg.encode()?;
        let signature = self
            .wallet
            .sign_message(payload.as_bytes())
            .await
            .map_err(|e| NodeError::Signing(e.to_string()))?;
        Ok(SignedMessage {
            signer: self.node_id.clone(),
            payload,
            signature: hex::encode(signature.to_vec()),
        })
    }
}
