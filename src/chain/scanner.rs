//! Height-by-height block scanner with durable retry state
//!
//! The scanner walks a source from its persisted position up to the
//! confirmed tip. A height whose fetch keeps failing is recorded as failed and
//! skipped; a separate sweep re-attempts failed heights. The persisted scan
//! position only ever covers a contiguous run of fully processed heights, so a
//! restart never skips a block.

use crate::config::ChainConfig;
use crate::error::{NodeError, NodeResult};
use crate::metrics::Metrics;
use crate::state::{BlockState, LocalStore};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Something with numbered blocks to extract items from
#[async_trait]
pub trait BlockSource: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Key under which scan state is stored
    fn name(&self) -> String;

    async fn latest_height(&self) -> NodeResult<u64>;

    /// Items of interest at `height`
    async fn extract(&self, height: u64) -> NodeResult<Vec<Self::Item>>;
}

/// Durable destination for extracted items
#[async_trait]
pub trait BlockSink<T: Send + 'static>: Send + Sync + 'static {
    async fn accept(&self, height: u64, items: Vec<T>) -> NodeResult<()>;
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub start_height: u64,
    pub confirmations: u64,
    pub poll_interval: Duration,
    pub max_fetch_attempts: u32,
    pub fetch_timeout: Duration,
    /// Delay before the second fetch attempt; grows linearly
    pub fetch_backoff: Duration,
    pub retry_interval: Duration,
    pub channel_capacity: usize,
}

impl ScannerConfig {
    pub fn from_chain(config: &ChainConfig, channel_capacity: usize) -> Self {
        Self {
            start_height: config.start_height,
            confirmations: config.confirmations,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_fetch_attempts: config.max_fetch_attempts.max(1),
            fetch_timeout: Duration::from_millis(config.fetch_timeout_ms),
            fetch_backoff: Duration::from_millis(config.poll_interval_ms.min(1_000)),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
            channel_capacity,
        }
    }
}

pub struct BlockScanner<S: BlockSource, K> {
    name: String,
    source: Arc<S>,
    sink: Arc<K>,
    store: Arc<LocalStore>,
    metrics: Arc<Metrics>,
    config: ScannerConfig,
    /// Highest height whose outcome (processed or recorded as failed) is durable
    completed_through: AtomicU64,
    messages: mpsc::Sender<u64>,
    cancel: CancellationToken,
}

impl<S, K> BlockScanner<S, K>
where
    S: BlockSource,
    K: BlockSink<S::Item>,
{
    /// Build a scanner; the receiver yields each height whose items reached the sink
    pub fn new(
        source: Arc<S>,
        sink: Arc<K>,
        store: Arc<LocalStore>,
        metrics: Arc<Metrics>,
        config: ScannerConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<u64>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let scanner = Self {
            name: source.name(),
            source,
            sink,
            store,
            metrics,
            config,
            completed_through: AtomicU64::new(0),
            messages: tx,
            cancel,
        };
        (scanner, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the scan loop and the retry sweep
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let scan = {
            let scanner = self.clone();
            tokio::spawn(async move { scanner.run_scan().await })
        };
        let retry = {
            let scanner = self.clone();
            tokio::spawn(async move { scanner.run_retry().await })
        };
        vec![scan, retry]
    }

    /// Next height to scan after a restart
    pub async fn resume_height(&self) -> NodeResult<u64> {
        let resume = match self.store.get_scan_position(&self.name).await? {
            Some(position) => position + 1,
            None => self.config.start_height,
        };
        self.completed_through
            .fetch_max(resume.saturating_sub(1), Ordering::SeqCst);
        Ok(resume)
    }

    /// Highest height with enough confirmations to scan
    pub async fn scannable_height(&self) -> NodeResult<u64> {
        let latest = timeout(self.config.fetch_timeout, self.source.latest_height())
            .await
            .map_err(|_| NodeError::Timeout {
                operation: format!("{} latest height", self.name),
            })??;
        Ok(latest.saturating_sub(self.config.confirmations))
    }

    async fn run_scan(&self) {
        let mut next = match self.resume_height().await {
            Ok(height) => height,
            Err(e) => {
                error!("Scanner {} cannot read its position: {}", self.name, e);
                return;
            }
        };
        info!("Scanner {} starting at height {}", self.name, next);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.scannable_height().await {
                Ok(tip) => {
                    while next <= tip && !self.cancel.is_cancelled() {
                        match self.scan_height(next).await {
                            Ok(_) => next += 1,
                            Err(e) => {
                                // could not record the outcome; try the same height again
                                error!("Scanner {} stalled at {}: {}", self.name, next, e);
                                self.metrics.record_error("scanner", e.class());
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Scanner {} cannot read chain tip: {}", self.name, e);
                    self.metrics.record_error("scanner", e.class());
                }
            }
            if self.pause(self.config.poll_interval).await {
                break;
            }
        }
        info!("Scanner {} stopped", self.name);
    }

    async fn run_retry(&self) {
        loop {
            if self.pause(self.config.retry_interval).await {
                break;
            }
            match self.retry_failed().await {
                Ok(0) => {}
                Ok(n) => info!("Scanner {} recovered {} failed blocks", self.name, n),
                Err(e) => {
                    warn!("Scanner {} retry sweep failed: {}", self.name, e);
                    self.metrics.record_error("scanner", e.class());
                }
            }
        }
    }

    /// Sleep for `duration`; true if cancelled meanwhile
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = sleep(duration) => false,
        }
    }

    /// Process one height. `Ok(false)` means it failed and was recorded for retry.
    pub async fn scan_height(&self, height: u64) -> NodeResult<bool> {
        let processed = match self.process(height).await {
            Ok(()) => true,
            Err(e) => {
                error!("Block {} on {} failed: {}", height, self.name, e);
                self.metrics.record_block_failed(&self.name);
                self.metrics.record_error("scanner", e.class());
                self.store
                    .set_block_status(&self.name, height, BlockState::Failed)
                    .await?;
                false
            }
        };
        self.completed_through.fetch_max(height, Ordering::SeqCst);
        self.advance_position().await?;
        Ok(processed)
    }

    /// Re-attempt every failed height once. Returns how many recovered.
    pub async fn retry_failed(&self) -> NodeResult<usize> {
        let statuses = self.store.block_statuses(&self.name).await?;
        let mut recovered = 0;
        for status in statuses {
            if self.cancel.is_cancelled() {
                break;
            }
            self.store
                .set_block_status(&self.name, status.height, BlockState::Pending)
                .await?;
            match self.process(status.height).await {
                Ok(()) => {
                    self.store
                        .remove_block_status(&self.name, status.height)
                        .await?;
                    recovered += 1;
                }
                Err(e) => {
                    warn!(
                        "Retry of block {} on {} failed: {}",
                        status.height, self.name, e
                    );
                    self.store
                        .set_block_status(&self.name, status.height, BlockState::Failed)
                        .await?;
                }
            }
        }
        if recovered > 0 {
            self.advance_position().await?;
        }
        Ok(recovered)
    }

    /// Fetch, deliver, and announce one height
    async fn process(&self, height: u64) -> NodeResult<()> {
        let items = self.fetch_with_retry(height).await?;
        let count = items.len();
        self.sink.accept(height, items).await?;
        self.store.remove_block_status(&self.name, height).await?;

        self.metrics.record_block_scanned(&self.name);
        if count > 0 {
            self.metrics.record_transfers(&self.name, count);
            debug!("Block {} on {}: {} items", height, self.name, count);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            sent = self.messages.send(height) => {
                if sent.is_err() {
                    debug!("No consumer for {} scan messages", self.name);
                }
            }
        }
        Ok(())
    }

    async fn fetch_with_retry(&self, height: u64) -> NodeResult<Vec<S::Item>> {
        let attempts = self.config.max_fetch_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match timeout(self.config.fetch_timeout, self.source.extract(height)).await {
                Ok(Ok(items)) => return Ok(items),
                Ok(Err(e)) => {
                    debug!(
                        "Fetch of {} block {} failed (attempt {}/{}): {}",
                        self.name, height, attempt, attempts, e
                    );
                    last_error = Some(e);
                }
                Err(_) => {
                    last_error = Some(NodeError::Timeout {
                        operation: format!("{} block {}", self.name, height),
                    });
                }
            }
            if attempt < attempts && self.pause(self.config.fetch_backoff * attempt).await {
                break;
            }
        }
        Err(last_error.unwrap_or_else(|| NodeError::Internal("fetch cancelled".to_string())))
    }

    /// Persist the highest height below every outstanding failure
    async fn advance_position(&self) -> NodeResult<u64> {
        let completed = self.completed_through.load(Ordering::SeqCst);
        let statuses = self.store.block_statuses(&self.name).await?;
        let candidate = match statuses.first() {
            Some(lowest) => lowest.height.saturating_sub(1).min(completed),
            None => completed,
        };
        let position = self.store.advance_scan_position(&self.name, candidate).await?;
        self.metrics.record_scan_height(&self.name, position);
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory_store;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Heights map to the number of leading fetch attempts that fail
    struct FlakySource {
        tip: u64,
        failures: Mutex<HashMap<u64, u32>>,
        calls: Mutex<HashMap<u64, u32>>,
    }

    impl FlakySource {
        fn new(tip: u64, failures: &[(u64, u32)]) -> Self {
            Self {
                tip,
                failures: Mutex::new(failures.iter().cloned().collect()),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls(&self, height: u64) -> u32 {
            self.calls.lock().unwrap().get(&height).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl BlockSource for FlakySource {
        type Item = u64;

        fn name(&self) -> String {
            "ETH".to_string()
        }

        async fn latest_height(&self) -> NodeResult<u64> {
            Ok(self.tip)
        }

        async fn extract(&self, height: u64) -> NodeResult<Vec<u64>> {
            *self.calls.lock().unwrap().entry(height).or_insert(0) += 1;
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&height) {
                if *left > 0 {
                    *left -= 1;
                    return Err(NodeError::ChainConnection {
                        chain: "ETH".into(),
                        message: "rpc down".into(),
                    });
                }
            }
            Ok(vec![height])
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl BlockSink<u64> for RecordingSink {
        async fn accept(&self, _height: u64, items: Vec<u64>) -> NodeResult<()> {
            self.seen.lock().unwrap().extend(items);
            Ok(())
        }
    }

    fn config() -> ScannerConfig {
        ScannerConfig {
            start_height: 1,
            confirmations: 2,
            poll_interval: Duration::from_millis(5),
            max_fetch_attempts: 3,
            fetch_timeout: Duration::from_secs(1),
            fetch_backoff: Duration::from_millis(1),
            retry_interval: Duration::from_millis(5),
            channel_capacity: 64,
        }
    }

    async fn scanner(
        source: FlakySource,
        store: Arc<LocalStore>,
    ) -> (
        BlockScanner<FlakySource, RecordingSink>,
        mpsc::Receiver<u64>,
        Arc<RecordingSink>,
    ) {
        let sink = Arc::new(RecordingSink::default());
        let (scanner, rx) = BlockScanner::new(
            Arc::new(source),
            sink.clone(),
            store,
            Arc::new(Metrics::new().unwrap()),
            config(),
            CancellationToken::new(),
        );
        (scanner, rx, sink)
    }

    #[tokio::test]
    async fn test_failed_block_recovered_by_sweep() {
        let store = Arc::new(memory_store().await);
        let (scanner, mut rx, sink) =
            scanner(FlakySource::new(600, &[(500, 3)]), store.clone()).await;
        store.advance_scan_position("ETH", 499).await.unwrap();
        assert_eq!(scanner.resume_height().await.unwrap(), 500);

        assert!(!scanner.scan_height(500).await.unwrap());
        assert_eq!(scanner.source.calls(500), 3);
        let statuses = store.block_statuses("ETH").await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, BlockState::Failed);

        // the scanner moves on, but the position cannot pass the failed block
        assert!(scanner.scan_height(501).await.unwrap());
        assert_eq!(rx.recv().await, Some(501));
        assert_eq!(store.get_scan_position("ETH").await.unwrap(), Some(499));

        assert_eq!(scanner.retry_failed().await.unwrap(), 1);
        assert_eq!(rx.recv().await, Some(500));
        assert!(store.block_statuses("ETH").await.unwrap().is_empty());
        assert_eq!(store.get_scan_position("ETH").await.unwrap(), Some(501));
        assert_eq!(*sink.seen.lock().unwrap(), vec![501, 500]);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_bound() {
        let store = Arc::new(memory_store().await);
        let (scanner, _rx, sink) = scanner(FlakySource::new(10, &[(1, 2)]), store.clone()).await;
        assert!(scanner.scan_height(1).await.unwrap());
        assert_eq!(scanner.source.calls(1), 3);
        assert_eq!(*sink.seen.lock().unwrap(), vec![1]);
        assert!(store.block_statuses("ETH").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scans_to_confirmed_tip_and_resumes() {
        let store = Arc::new(memory_store().await);
        let (scanner, _rx, sink) = scanner(FlakySource::new(10, &[]), store.clone()).await;
        let scanner = Arc::new(scanner);
        let handles = scanner.start();

        for _ in 0..200 {
            if sink.seen.lock().unwrap().len() >= 8 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        scanner.cancel.cancel();
        futures::future::join_all(handles).await;

        assert_eq!(*sink.seen.lock().unwrap(), (1..=8).collect::<Vec<_>>());
        assert_eq!(store.get_scan_position("ETH").await.unwrap(), Some(8));

        // a fresh scanner over the same store picks up after the position
        let (restarted, _rx, _sink) = scanner_with_tip(12, store.clone()).await;
        assert_eq!(restarted.resume_height().await.unwrap(), 9);
    }

    async fn scanner_with_tip(
        tip: u64,
        store: Arc<LocalStore>,
    ) -> (
        BlockScanner<FlakySource, RecordingSink>,
        mpsc::Receiver<u64>,
        Arc<RecordingSink>,
    ) {
        scanner(FlakySource::new(tip, &[]), store).await
    }

    #[tokio::test]
    async fn test_position_survives_restart_with_failed_block() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("scan.db").display());
        {
            let store = Arc::new(LocalStore::connect(&url).await.unwrap());
            store.run_migrations().await.unwrap();
            let (scanner, _rx, _sink) =
                scanner(FlakySource::new(100, &[(3, 10)]), store.clone()).await;
            for h in 1..=5 {
                scanner.scan_height(h).await.unwrap();
            }
            assert_eq!(store.get_scan_position("ETH").await.unwrap(), Some(2));
        }
        let store = Arc::new(LocalStore::connect(&url).await.unwrap());
        store.run_migrations().await.unwrap();
        let (scanner, _rx, sink) = scanner(FlakySource::new(100, &[]), store.clone()).await;
        // resumes after the contiguous prefix and still owes block 3
        assert_eq!(scanner.resume_height().await.unwrap(), 3);
        assert_eq!(scanner.retry_failed().await.unwrap(), 1);
        assert_eq!(*sink.seen.lock().unwrap(), vec![3]);
    }
}
