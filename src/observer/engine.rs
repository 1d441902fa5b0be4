//! Observer engine - drains the local queue into the ledger
//!
//! Scanner completion messages trigger a pass over new items; a retry loop
//! picks up failed ones on a timer. Every item is claimed in the store before
//! it is handed to a worker, so two workers never submit the same observation.

use super::queue::ObservationQueue;
use super::signer::MessageSigner;
use crate::config::NodeConfig;
use crate::error::{ErrorClass, NodeError, NodeResult};
use crate::ledger::LedgerClient;
use crate::messages::{LedgerMsg, SubmitResponse};
use crate::metrics::Metrics;
use crate::state::LocalQueueItem;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    pub retry_interval: Duration,
    pub submit_timeout: Duration,
    pub max_submit_attempts: u32,
    pub submit_backoff: Duration,
}

impl From<&NodeConfig> for ObserverConfig {
    fn from(config: &NodeConfig) -> Self {
        Self {
            workers: config.submit_workers.max(1),
            channel_capacity: config.channel_capacity.max(1),
            retry_interval: config.retry_interval(),
            submit_timeout: config.submit_timeout(),
            max_submit_attempts: config.max_submit_attempts.max(1),
            submit_backoff: Duration::from_millis(100),
        }
    }
}

/// What happened to a queue item after a processing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Accepted by the ledger and removed
    Submitted,
    /// Deterministically refused; removed without retry
    Dropped,
    /// Left in the queue as failed for the retry loop
    Retry,
}

pub struct Observer {
    queue: Arc<ObservationQueue>,
    ledger: Arc<dyn LedgerClient>,
    signer: Arc<dyn MessageSigner>,
    metrics: Arc<Metrics>,
    config: ObserverConfig,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Observer {
    pub fn new(
        queue: Arc<ObservationQueue>,
        ledger: Arc<dyn LedgerClient>,
        signer: Arc<dyn MessageSigner>,
        metrics: Arc<Metrics>,
        config: ObserverConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            ledger,
            signer,
            metrics,
            config,
            cancel,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Recover in-flight items, then spawn workers, dispatchers and the retry loop
    pub async fn start(self: &Arc<Self>, messages: Vec<mpsc::Receiver<u64>>) -> NodeResult<()> {
        self.queue.recover().await?;

        let (work_tx, work_rx) = mpsc::channel::<LocalQueueItem>(self.config.channel_capacity);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(1);
        let mut handles = self.handles.lock().await;

        for id in 0..self.config.workers {
            let observer = self.clone();
            let rx = work_rx.clone();
            handles.push(tokio::spawn(async move { observer.worker(id, rx).await }));
        }

        for mut rx in messages {
            let notify = notify_tx.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let height = tokio::select! {
                        _ = cancel.cancelled() => break,
                        height = rx.recv() => height,
                    };
                    match height {
                        // a pending wake-up already covers this height
                        Some(_) => {
                            let _ = notify.try_send(());
                        }
                        None => break,
                    }
                }
            }));
        }
        drop(notify_tx);

        {
            let observer = self.clone();
            let work = work_tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = observer.cancel.cancelled() => break,
                        wake = notify_rx.recv() => {
                            if wake.is_none() {
                                break;
                            }
                            if let Err(e) = observer.dispatch(false, &work).await {
                                warn!("Dispatch of new observations failed: {}", e);
                            }
                        }
                    }
                }
            }));
        }

        {
            let observer = self.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    match observer.dispatch(true, &work_tx).await {
                        Ok(0) => {}
                        Ok(n) => debug!("Retry loop dispatched {} observations", n),
                        Err(e) => warn!("Retry dispatch failed: {}", e),
                    }
                    tokio::select! {
                        _ = observer.cancel.cancelled() => break,
                        _ = sleep(observer.config.retry_interval) => {}
                    }
                }
            }));
        }

        info!(
            "Observer started with {} submit workers",
            self.config.workers
        );
        Ok(())
    }

    /// Claim queued items and hand them to the workers
    async fn dispatch(
        &self,
        include_retries: bool,
        work: &mpsc::Sender<LocalQueueItem>,
    ) -> NodeResult<usize> {
        let mut dispatched = 0;
        for item in self.queue.dequeue(include_retries).await? {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.queue.mark_processing(&item.key).await? {
                continue;
            }
            tokio::select! {
                // claimed items left behind are recovered on the next start
                _ = self.cancel.cancelled() => break,
                sent = work.send(item) => {
                    if sent.is_err() {
                        break;
                    }
                    dispatched += 1;
                }
            }
        }
        Ok(dispatched)
    }

    async fn worker(&self, id: usize, rx: Arc<Mutex<mpsc::Receiver<LocalQueueItem>>>) {
        debug!("Submit worker {} started", id);
        loop {
            let item = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            match item {
                Some(item) => {
                    self.process_item(item).await;
                }
                None => break,
            }
        }
        debug!("Submit worker {} stopped", id);
    }

    /// Sign and submit one claimed item, then settle it in the queue
    pub async fn process_item(&self, item: LocalQueueItem) -> Disposition {
        let key = item.key.clone();
        let chain = key.chain.to_string();
        let started = Instant::now();
        let result = self.submit_with_retry(&item.msg).await;
        self.metrics
            .record_submit_latency(&chain, started.elapsed().as_secs_f64());

        let (disposition, settled) = match result {
            Ok(response) => {
                debug!(
                    "Submitted {} {} as {} at height {}",
                    item.msg.name(),
                    key,
                    response.tx_hash,
                    response.height
                );
                self.metrics.record_submission(&chain, "accepted");
                (Disposition::Submitted, self.queue.remove(&key).await)
            }
            Err(e) if matches!(e.class(), ErrorClass::Rejected | ErrorClass::Malformed) => {
                error!("Ledger refused {} {}, dropping: {}", item.msg.name(), key, e);
                self.metrics.record_submission(&chain, "rejected");
                self.metrics.record_error("observer", e.class());
                (Disposition::Dropped, self.queue.remove(&key).await)
            }
            Err(e) => {
                warn!(
                    "Submission of {} failed after {} attempt(s), will retry: {}",
                    key, item.attempts, e
                );
                self.metrics.record_submission(&chain, "failed");
                self.metrics.record_error("observer", e.class());
                (Disposition::Retry, self.queue.mark_failed(&key).await)
            }
        };
        if let Err(e) = settled {
            // the claim stays held until restart recovery
            error!("Cannot update queue entry {}: {}", key, e);
            self.metrics.record_error("queue", e.class());
        }
        disposition
    }

    async fn submit_with_retry(&self, msg: &LedgerMsg) -> NodeResult<SubmitResponse> {
        let attempts = self.config.max_submit_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let submit = async {
                let signed = self.signer.sign(msg).await?;
                self.ledger.submit(signed).await
            };
            match timeout(self.config.submit_timeout, submit).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {
                    last_error = Some(NodeError::Timeout {
                        operation: format!("submit {}", msg.name()),
                    })
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = sleep(self.config.submit_backoff * attempt) => {}
                }
            }
        }
        Err(last_error.unwrap_or_else(|| NodeError::Internal("submission cancelled".to_string())))
    }

    /// Cancel all loops and wait for them to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        futures::future::join_all(handles).await;
        info!("Observer stopped");
    }
}
