//! Dispatcher: pulls bounded batches off the stream, fans events out to a
//! fixed worker pool through a bounded queue (back-pressure), supervises
//! every per-event analysis, and commits stream progress only once the
//! whole batch has reached a terminal status.

use crate::config::DispatcherConfig;
use crate::error::{DetectionError, Result};
use crate::models::{AnalysisOutcome, AnalysisStatus, Event};
use crate::service::EventAnalyzer;
use crate::stream::{decode_event, EventStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Running tallies of terminal statuses; every dispatched event lands in
/// exactly one bucket, so nothing disappears without an audit trail.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub matched: AtomicU64,
    pub no_match: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub invalid: AtomicU64,
    pub store_failures: AtomicU64,
}

impl DispatcherStats {
    pub fn terminal_total(&self) -> u64 {
        self.matched.load(Ordering::SeqCst)
            + self.no_match.load(Ordering::SeqCst)
            + self.failed.load(Ordering::SeqCst)
            + self.timed_out.load(Ordering::SeqCst)
    }
}

enum WorkerResult {
    Terminal(AnalysisOutcome),
    /// Store retries exhausted: the event must stay uncommitted.
    Uncommitted(DetectionError),
}

pub struct Dispatcher {
    analyzer: Arc<dyn EventAnalyzer>,
    cfg: DispatcherConfig,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(analyzer: Arc<dyn EventAnalyzer>, cfg: DispatcherConfig) -> Self {
        Self {
            analyzer,
            cfg,
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Consumes batches until shutdown. The shutdown signal stops new
    /// fetches immediately; an in-flight batch gets the configured grace
    /// period to drain, after which it is abandoned with its offsets
    /// uncommitted, guaranteeing redelivery over loss.
    pub async fn run(
        &self,
        stream: Arc<dyn EventStream>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = self.run_batch(stream.as_ref());
            tokio::pin!(batch);
            let outcome = tokio::select! {
                res = &mut batch => Some(res),
                _ = shutdown.changed() => {
                    if timeout(self.cfg.shutdown_grace(), &mut batch).await.is_err() {
                        warn!("shutdown grace expired, abandoning in-flight batch");
                    }
                    None
                }
            };
            match outcome {
                None => break,
                Some(Ok(0)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.poll_interval()) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "stream fetch failed, backing off");
                    tokio::time::sleep(self.cfg.poll_interval()).await;
                }
            }
        }
        info!(target: "threat-detection", "dispatcher stopped");
        Ok(())
    }

    /// Processes a single batch end to end and returns how many messages
    /// the fetch produced. Progress is committed only when every decoded
    /// event reached a terminal status; a store-exhaustion anywhere in the
    /// batch leaves the offsets uncommitted for redelivery.
    pub async fn run_batch(&self, stream: &dyn EventStream) -> Result<usize> {
        let messages = stream.fetch(self.cfg.batch_size).await?;
        if messages.is_empty() {
            return Ok(0);
        }
        let total = messages.len();

        let (tx, rx) = mpsc::channel::<Event>(self.cfg.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for worker_id in 0..self.cfg.worker_count {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&self.analyzer),
                self.cfg.event_timeout(),
                Arc::clone(&self.stats),
            ));
        }

        for msg in messages {
            match decode_event(&msg) {
                Ok(event) => {
                    // awaits when the queue is full: reads stall instead of
                    // buffering unbounded memory
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(topic = %msg.topic, key = %msg.key, error = %e, "dropping malformed message");
                    self.stats.invalid.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        drop(tx);

        let mut store_failed = false;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(worker_store_failed) => store_failed |= worker_store_failed,
                Err(e) => {
                    error!(error = %e, "worker task aborted");
                    store_failed = true;
                }
            }
        }

        if store_failed {
            self.stats.store_failures.fetch_add(1, Ordering::SeqCst);
            warn!("batch left uncommitted after store exhaustion, upstream will redeliver");
        } else {
            stream.commit().await?;
        }
        Ok(total)
    }
}

/// Drains the shared queue until it closes. Returns whether any event in
/// this worker hit store exhaustion.
async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Event>>>,
    analyzer: Arc<dyn EventAnalyzer>,
    deadline: std::time::Duration,
    stats: Arc<DispatcherStats>,
) -> bool {
    let mut store_failed = false;
    loop {
        let event = { rx.lock().await.recv().await };
        let Some(event) = event else {
            return store_failed;
        };
        let event_id = event.event_id.clone();
        match supervised_analyze(Arc::clone(&analyzer), event, deadline).await {
            WorkerResult::Terminal(outcome) => {
                let bucket = match outcome.status {
                    AnalysisStatus::Matched => &stats.matched,
                    AnalysisStatus::NoMatch => &stats.no_match,
                    AnalysisStatus::AnalysisFailed => &stats.failed,
                    AnalysisStatus::AnalysisTimeout => &stats.timed_out,
                };
                bucket.fetch_add(1, Ordering::SeqCst);
                info!(
                    target: "threat-detection",
                    worker = worker_id,
                    event = %outcome.event_id,
                    status = ?outcome.status,
                    matches = outcome.matches.len(),
                    anomalies = outcome.anomalies.len(),
                    "event analyzed"
                );
            }
            WorkerResult::Uncommitted(e) => {
                warn!(worker = worker_id, event = %event_id, error = %e, "event left uncommitted");
                store_failed = true;
            }
        }
    }
}

/// Supervision boundary: the analyzer runs in its own task under a
/// deadline, so a panic or a hang is converted into a typed terminal
/// status instead of taking the worker down.
async fn supervised_analyze(
    analyzer: Arc<dyn EventAnalyzer>,
    event: Event,
    deadline: std::time::Duration,
) -> WorkerResult {
    let event_id = event.event_id.clone();
    let mut handle = tokio::spawn(async move { analyzer.analyze(&event).await });
    match timeout(deadline, &mut handle).await {
        Err(_) => {
            handle.abort();
            warn!(event = %event_id, "analysis deadline exceeded");
            WorkerResult::Terminal(AnalysisOutcome::terminal(
                event_id,
                AnalysisStatus::AnalysisTimeout,
            ))
        }
        Ok(Ok(Ok(outcome))) => WorkerResult::Terminal(outcome),
        Ok(Ok(Err(DetectionError::TransientStore(e)))) => {
            WorkerResult::Uncommitted(DetectionError::TransientStore(e))
        }
        Ok(Ok(Err(e))) => {
            warn!(event = %event_id, error = %e, "analysis failed");
            WorkerResult::Terminal(AnalysisOutcome::terminal(
                event_id,
                AnalysisStatus::AnalysisFailed,
            ))
        }
        Ok(Err(join_err)) => {
            if join_err.is_panic() {
                error!(event = %event_id, "analyzer panicked, event isolated");
            }
            WorkerResult::Terminal(AnalysisOutcome::terminal(
                event_id,
                AnalysisStatus::AnalysisFailed,
            ))
        }
    }
}
