//! Observer - submits witnessed transfers to the ledger
//!
//! Handles:
//! - The durable local observation queue fed by chain scanners
//! - Signing messages with the node key
//! - Submission with bounded retry, and recovery of in-flight items on restart

pub mod engine;
pub mod queue;
pub mod signer;

pub use engine::{Observer, ObserverConfig};
pub use queue::ObservationQueue;
pub use signer::{MessageSigner, WalletSigner};
