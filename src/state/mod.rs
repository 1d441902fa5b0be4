//! Node-local persistence
//!
//! Handles:
//! - Contiguous scan positions per chain for restart recovery
//! - Per-height retry status for blocks that failed to process
//! - The local observation queue awaiting ledger submission
//! - Outbound broadcasts already sent by this node

mod store;

pub use store::{BlockState, BroadcastRecord, LocalQueueItem, LocalStore, QueueStatus};

#[cfg(test)]
pub(crate) use store::tests::memory_store;
