//! Outbound module - pays what the ledger schedules
//!
//! The block scanner is pointed at the ledger's sealed heights. Items whose
//! vault this node controls are broadcast on their chain with an
//! `OUTBOUND:<inbound id>` memo, which the chain scanners later observe and
//! report back for correlation.

pub mod broadcaster;
pub mod sink;
pub mod source;

pub use broadcaster::EvmBroadcaster;
pub use sink::OutboundSigner;
pub use source::TxOutSource;

use crate::chain::ScannerConfig;
use crate::config::Settings;
use std::time::Duration;

/// Scan settings for walking ledger heights: sealed heights are final
pub fn scanner_config(settings: &Settings) -> ScannerConfig {
    let block_time = Duration::from_millis(settings.ledger.block_time_ms.max(1));
    ScannerConfig {
        start_height: 1,
        confirmations: 0,
        poll_interval: block_time,
        max_fetch_attempts: settings.node.max_submit_attempts.max(1),
        fetch_timeout: settings.node.submit_timeout(),
        fetch_backoff: block_time.min(Duration::from_secs(1)),
        retry_interval: settings.node.retry_interval(),
        channel_capacity: settings.node.channel_capacity.max(1),
    }
}
