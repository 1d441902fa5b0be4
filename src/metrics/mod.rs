//! Prometheus metrics for monitoring
//!
//! All collectors hang off an explicitly constructed [`Metrics`] handle that is
//! created once in `main` and passed to every component. Nothing registers into
//! the process-wide default registry.
//!
//! Exposes metrics for:
//! - Scanner progress and block failures
//! - Local observation queue submissions
//! - Ledger voting, finalization and outbound correlation
//! - Errors by handling class

use crate::error::{ErrorClass, NodeResult};

use axum::{extract::State, routing::get, Router};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Collectors for one node process
pub struct Metrics {
    registry: Registry,
    scan_height: GaugeVec,
    blocks_scanned: IntCounterVec,
    block_failures: IntCounterVec,
    transfers_observed: IntCounterVec,
    submissions: IntCounterVec,
    submit_latency: HistogramVec,
    votes: IntCounterVec,
    finalized: IntCounterVec,
    txout_items: IntCounterVec,
    outbound_correlated: IntCounterVec,
    errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("vault_observer".to_string()), None)?;

        let scan_height = GaugeVec::new(
            Opts::new("scan_height", "Highest contiguous block height scanned per chain"),
            &["chain"],
        )?;
        let blocks_scanned = IntCounterVec::new(
            Opts::new("blocks_scanned_total", "Blocks successfully scanned"),
            &["chain"],
        )?;
        let block_failures = IntCounterVec::new(
            Opts::new("block_failures_total", "Blocks marked failed after exhausting fetch retries"),
            &["chain"],
        )?;
        let transfers_observed = IntCounterVec::new(
            Opts::new("transfers_observed_total", "Vault transfers extracted from blocks"),
            &["chain"],
        )?;
        let submissions = IntCounterVec::new(
            Opts::new("submissions_total", "Ledger submissions by outcome"),
            &["chain", "outcome"],
        )?;
        let submit_latency = HistogramVec::new(
            HistogramOpts::new("submit_latency_seconds", "Ledger submission latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["chain"],
        )?;
        let votes = IntCounterVec::new(
            Opts::new("votes_total", "Observation votes applied by outcome"),
            &["outcome"],
        )?;
        let finalized = IntCounterVec::new(
            Opts::new("observations_finalized_total", "Observations that reached quorum"),
            &["chain", "memo"],
        )?;
        let txout_items = IntCounterVec::new(
            Opts::new("txout_items_total", "Outbound items enqueued"),
            &["chain"],
        )?;
        let outbound_correlated = IntCounterVec::new(
            Opts::new("outbound_correlated_total", "Outbound items matched to an observed outbound"),
            &["chain"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Errors by component and handling class"),
            &["component", "class"],
        )?;

        registry.register(Box::new(scan_height.clone()))?;
        registry.register(Box::new(blocks_scanned.clone()))?;
        registry.register(Box::new(block_failures.clone()))?;
        registry.register(Box::new(transfers_observed.clone()))?;
        registry.register(Box::new(submissions.clone()))?;
        registry.register(Box::new(submit_latency.clone()))?;
        registry.register(Box::new(votes.clone()))?;
        registry.register(Box::new(finalized.clone()))?;
        registry.register(Box::new(txout_items.clone()))?;
        registry.register(Box::new(outbound_correlated.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            registry,
            scan_height,
            blocks_scanned,
            block_failures,
            transfers_observed,
            submissions,
            submit_latency,
            votes,
            finalized,
            txout_items,
            outbound_correlated,
            errors,
        })
    }

    /// Render all collectors in the text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn record_scan_height(&self, chain: &str, height: u64) {
        self.scan_height.with_label_values(&[chain]).set(height as f64);
    }

    pub fn record_block_scanned(&self, chain: &str) {
        self.blocks_scanned.with_label_values(&[chain]).inc();
    }

    pub fn record_block_failed(&self, chain: &str) {
        self.block_failures.with_label_values(&[chain]).inc();
    }

    pub fn record_transfers(&self, chain: &str, count: usize) {
        self.transfers_observed
            .with_label_values(&[chain])
            .inc_by(count as u64);
    }

    pub fn record_submission(&self, chain: &str, outcome: &str) {
        self.submissions.with_label_values(&[chain, outcome]).inc();
    }

    pub fn record_submit_latency(&self, chain: &str, latency_secs: f64) {
        self.submit_latency
            .with_label_values(&[chain])
            .observe(latency_secs);
    }

    pub fn record_vote(&self, outcome: &str) {
        self.votes.with_label_values(&[outcome]).inc();
    }

    pub fn record_finalized(&self, chain: &str, memo: &str) {
        self.finalized.with_label_values(&[chain, memo]).inc();
    }

    pub fn record_txout_item(&self, chain: &str) {
        self.txout_items.with_label_values(&[chain]).inc();
    }

    pub fn record_outbound_correlated(&self, chain: &str) {
        self.outbound_correlated.with_label_values(&[chain]).inc();
    }

    pub fn record_error(&self, component: &str, class: ErrorClass) {
        self.errors
            .with_label_values(&[component, class.as_str()])
            .inc();
    }
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
    metrics: Arc<Metrics>,
}

impl MetricsServer {
    pub fn new(port: u16, metrics: Arc<Metrics>) -> Self {
        Self { port, metrics }
    }

    pub async fn run(&self) -> NodeResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.metrics.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::NodeError::Config(format!("bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::NodeError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_block_scanned("ETH");
        a.record_error("scanner", ErrorClass::Transient);

        let rendered = a.render();
        assert!(rendered.contains("vault_observer_blocks_scanned_total{chain=\"ETH\"} 1"));
        assert!(rendered.contains("class=\"transient\""));
        assert!(!b.render().contains("blocks_scanned_total{"));
    }
}
