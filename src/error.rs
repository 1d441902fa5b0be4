//! Error types for the vault observer

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How an error is handled by the pipeline that hit it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// RPC timeouts and temporary unavailability: retried with bounded backoff
    Transient,
    /// Unparseable external data: the offending transfer is dropped
    Malformed,
    /// Local store failure: retried on the next sweep
    Persistence,
    /// Deterministic ledger rejection: never retried
    Rejected,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Malformed => "malformed",
            ErrorClass::Persistence => "persistence",
            ErrorClass::Rejected => "rejected",
        }
    }
}

/// Main error type for the observer node
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("Block {height} not yet produced on chain {chain}")]
    BlockNotAvailable { chain: String, height: u64 },

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("Invalid memo {memo:?}: {reason}")]
    InvalidMemo { memo: String, reason: String },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Broadcast error on chain {chain}: {message}")]
    Broadcast { chain: String, message: String },

    #[error("Rejected by ledger: {0}")]
    Rejected(#[from] LedgerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NodeError {
    /// Map the error onto the handling taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            NodeError::ChainConnection { .. }
            | NodeError::BlockNotAvailable { .. }
            | NodeError::LedgerUnavailable(_)
            | NodeError::Timeout { .. }
            | NodeError::Broadcast { .. } => ErrorClass::Transient,
            NodeError::Malformed(_)
            | NodeError::InvalidMemo { .. }
            | NodeError::Serialization(_) => ErrorClass::Malformed,
            NodeError::Database(_) | NodeError::Internal(_) | NodeError::Signing(_) => {
                ErrorClass::Persistence
            }
            NodeError::Rejected(_) | NodeError::Config(_) => ErrorClass::Rejected,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Persistence
        )
    }
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

/// Rule violations raised deterministically while applying a ledger message
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LedgerError {
    #[error("signer {0} is not an active node")]
    UnauthorizedSigner(String),

    #[error("signature does not match payload")]
    BadSignature,

    #[error("address {address} is not an authorized vault on {chain}")]
    UnauthorizedVault { chain: String, address: String },

    #[error("no vault for chain {0}")]
    NoVault(String),

    #[error("observation {0} is already finalized")]
    AlreadyFinalized(String),

    #[error("no observation voter for {0}")]
    UnknownVoter(String),

    #[error("{what} height {current} is larger than {proposed}, height can't go backward")]
    HeightRegression {
        what: String,
        current: u64,
        proposed: u64,
    },

    #[error("signer {0} is not an admin")]
    UnauthorizedAdmin(String),

    #[error("admin sequence {proposed} does not follow {current}")]
    StaleSequence { current: u64, proposed: u64 },

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for ledger state transitions
pub type LedgerResult<T> = Result<T, LedgerError>;
