//! Background deduplication daemon.
//!
//! Producers call [`DedupDaemon::mark_for_deduplication`] after writing an
//! attribute; that only enqueues. A single named worker thread drains the
//! queue in batches, merges every distinct pair in the batch, then acks.
//!
//! ```text
//!  producers ──insert──▶ AttributeQueue ──read(batch)──▶ worker
//!                              ▲                           │
//!                              └────────── ack ◀── deduplicate(pair) × N
//! ```
//!
//! The worker blocks inside `read`, and after a batch that requeued records
//! it pauses with a doubling delay so a pair that keeps failing is not
//! redelivered in a tight loop. `stop` cancels its token and wakes the queue
//! so a blocked read returns `Cancelled`; the pause checks the token too. A
//! batch already being merged runs to completion first.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::attribute::{Attribute, KeyspaceIndexPair, VertexId};
use crate::deduplicator::deduplicate;
use crate::error::{ConfigError, DedupError, QueueError};
use crate::queue::{AttributeQueue, CancelToken, QueuedAttribute};
use crate::retry::RetryPolicy;
use crate::store::SessionFactory;

const WORKER_THREAD_NAME: &str = "attrdedup-daemon";

fn lock_err(context: &'static str) -> DedupError {
    DedupError::internal(format!("poisoned lock: {context}"))
}

/// What to acknowledge after a batch has been processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Ack every record of the batch, whether or not its merge succeeded.
    #[default]
    WholeBatch,
    /// Re-insert the records of failed pairs at the tail, then ack the batch.
    RequeueFailed,
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Maximum records taken from the queue per iteration.
    pub batch_size: usize,
    /// Retry policy wrapped around each pair's merge.
    pub retry: RetryPolicy,
    /// What happens to records whose pair failed to merge.
    pub ack_policy: AckPolicy,
    /// Pause after the first batch that requeued records. Doubles for every
    /// consecutive requeueing batch.
    #[serde(with = "crate::retry::millis")]
    pub requeue_delay: Duration,
    /// Upper bound for the requeue pause.
    #[serde(with = "crate::retry::millis")]
    pub max_requeue_delay: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            retry: RetryPolicy::default(),
            ack_policy: AckPolicy::default(),
            requeue_delay: Duration::from_millis(100),
            max_requeue_delay: Duration::from_secs(30),
        }
    }
}

impl DaemonConfig {
    /// Check field ranges, returning the config unchanged when valid.
    ///
    /// # Errors
    /// - `Invalid` naming the first out-of-range field
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "daemon.batch_size".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.requeue_delay.is_zero() {
            return Err(ConfigError::Invalid {
                field: "daemon.requeue_delay".to_string(),
                reason: "must be at least 1ms".to_string(),
            });
        }
        if self.max_requeue_delay < self.requeue_delay {
            return Err(ConfigError::Invalid {
                field: "daemon.max_requeue_delay".to_string(),
                reason: "must not be below daemon.requeue_delay".to_string(),
            });
        }
        let retry = self.retry.validate()?;
        Ok(Self { retry, ..self })
    }

    /// Pause after the `round`-th consecutive batch that requeued records.
    /// `round` is 1-based.
    #[must_use]
    pub fn requeue_backoff(&self, round: u32) -> Duration {
        let factor = 1u32.checked_shl(round.saturating_sub(1)).unwrap_or(u32::MAX);
        self.requeue_delay
            .checked_mul(factor)
            .map_or(self.max_requeue_delay, |d| d.min(self.max_requeue_delay))
    }
}

#[derive(Debug, Default)]
struct DaemonStats {
    workers_spawned: AtomicU64,
    batches: AtomicU64,
    records_acked: AtomicU64,
    records_requeued: AtomicU64,
    pairs_merged: AtomicU64,
    pairs_failed: AtomicU64,
    duplicates_removed: AtomicU64,
}

impl DaemonStats {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn snapshot(&self) -> DaemonStatsSnapshot {
        DaemonStatsSnapshot {
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            records_acked: self.records_acked.load(Ordering::Relaxed),
            records_requeued: self.records_requeued.load(Ordering::Relaxed),
            pairs_merged: self.pairs_merged.load(Ordering::Relaxed),
            pairs_failed: self.pairs_failed.load(Ordering::Relaxed),
            duplicates_removed: self.duplicates_removed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the daemon counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStatsSnapshot {
    /// Worker threads started over the daemon's lifetime.
    pub workers_spawned: u64,
    /// Non-empty batches read from the queue.
    pub batches: u64,
    /// Records acknowledged, including ones that were requeued.
    pub records_acked: u64,
    /// Records re-inserted under [`AckPolicy::RequeueFailed`].
    pub records_requeued: u64,
    /// Pairs whose merge returned successfully, including no-ops.
    pub pairs_merged: u64,
    /// Pairs whose merge failed after retries.
    pub pairs_failed: u64,
    /// Duplicate attribute vertices deleted.
    pub duplicates_removed: u64,
}

type Outcome = Arc<Mutex<Option<Result<(), DedupError>>>>;

/// Observes one worker's exit. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    // Never sent on; disconnects when the worker thread ends.
    done: Receiver<()>,
    outcome: Outcome,
}

impl DaemonHandle {
    /// Block until the worker exits and return its outcome.
    pub fn wait(&self) -> Result<(), DedupError> {
        let _ = self.done.recv();
        self.outcome()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. `None` means the
    /// worker is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), DedupError>> {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => None,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Some(self.outcome()),
        }
    }

    /// Whether the worker has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn outcome(&self) -> Result<(), DedupError> {
        self.outcome
            .lock()
            .map_err(|_| lock_err("daemon outcome"))?
            .clone()
            .unwrap_or_else(|| Err(DedupError::internal("daemon worker exited without an outcome")))
    }
}

struct Worker {
    cancel: CancelToken,
    join: JoinHandle<()>,
    handle: DaemonHandle,
}

/// Everything the worker loop needs, shared with the daemon.
struct LoopContext {
    queue: Arc<dyn AttributeQueue>,
    sessions: Arc<dyn SessionFactory>,
    config: DaemonConfig,
    stats: Arc<DaemonStats>,
}

/// Drains the queue and merges duplicate attributes in the background.
pub struct DedupDaemon {
    queue: Arc<dyn AttributeQueue>,
    sessions: Arc<dyn SessionFactory>,
    config: DaemonConfig,
    stats: Arc<DaemonStats>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for DedupDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupDaemon")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl DedupDaemon {
    /// Create a stopped daemon.
    ///
    /// # Errors
    /// - `Config` if `config` is invalid
    pub fn new(
        queue: Arc<dyn AttributeQueue>,
        sessions: Arc<dyn SessionFactory>,
        config: DaemonConfig,
    ) -> Result<Self, DedupError> {
        Ok(Self {
            queue,
            sessions,
            config: config.validate()?,
            stats: Arc::new(DaemonStats::default()),
            worker: Mutex::new(None),
        })
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// The queue producers write into.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn AttributeQueue> {
        &self.queue
    }

    /// Spawn the worker unless one is already running.
    ///
    /// Returns a handle to the running worker either way.
    ///
    /// # Errors
    /// - `Internal` if the worker thread cannot be spawned
    pub fn start(&self) -> Result<DaemonHandle, DedupError> {
        let mut slot = self.worker.lock().map_err(|_| lock_err("daemon start"))?;

        if let Some(worker) = slot.as_ref() {
            if !worker.handle.is_finished() {
                return Ok(worker.handle.clone());
            }
        }
        // Reap a worker that exited on its own (read or ack failure).
        if let Some(finished) = slot.take() {
            let _ = finished.join.join();
        }

        let cancel = CancelToken::new();
        let (done_tx, done_rx) = bounded::<()>(0);
        let outcome: Outcome = Arc::new(Mutex::new(None));

        let ctx = LoopContext {
            queue: Arc::clone(&self.queue),
            sessions: Arc::clone(&self.sessions),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        };
        let thread_cancel = cancel.clone();
        let thread_outcome = Arc::clone(&outcome);

        let join = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let result = run_loop(&ctx, &thread_cancel);
                if let Ok(mut slot) = thread_outcome.lock() {
                    *slot = Some(result);
                }
                drop(done_tx);
            })
            .map_err(|e| DedupError::internal(format!("failed to spawn daemon worker: {e}")))?;

        self.stats.workers_spawned.fetch_add(1, Ordering::Relaxed);
        info!(batch_size = self.config.batch_size, "deduplication daemon started");

        let handle = DaemonHandle {
            done: done_rx,
            outcome,
        };
        *slot = Some(Worker {
            cancel,
            join,
            handle: handle.clone(),
        });
        Ok(handle)
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// A batch in progress is finished first. Without a running worker this
    /// is a no-op.
    ///
    /// # Errors
    /// - whatever ended the worker loop, if it failed before being stopped
    /// - `Internal` if the worker panicked
    pub fn stop(&self) -> Result<(), DedupError> {
        let mut slot = self.worker.lock().map_err(|_| lock_err("daemon stop"))?;
        let Some(worker) = slot.take() else {
            return Ok(());
        };

        worker.cancel.cancel();
        self.queue.wake_readers();

        if worker.join.join().is_err() {
            return Err(DedupError::internal("daemon worker panicked"));
        }
        let result = worker.handle.wait();
        info!(stats = ?self.stats.snapshot(), "deduplication daemon stopped");
        result
    }

    /// Record that `vertex_id` may duplicate another attribute. Only enqueues.
    ///
    /// # Errors
    /// - `Queue` if the record could not be made durable
    pub fn mark_for_deduplication(
        &self,
        keyspace: impl Into<String>,
        value_index: impl Into<String>,
        vertex_id: VertexId,
    ) -> Result<u64, DedupError> {
        let attribute = Attribute::new(keyspace, value_index, vertex_id);
        let sequence = self.queue.insert(attribute)?;
        debug!(sequence, %vertex_id, "marked attribute for deduplication");
        Ok(sequence)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DaemonStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for DedupDaemon {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "deduplication daemon did not stop cleanly");
        }
    }
}

fn run_loop(ctx: &LoopContext, cancel: &CancelToken) -> Result<(), DedupError> {
    // Consecutive batches that put records back into the queue.
    let mut requeue_rounds: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let batch = match ctx.queue.read(ctx.config.batch_size, cancel) {
            Ok(batch) => batch,
            Err(QueueError::Cancelled | QueueError::Closed) => return Ok(()),
            Err(e) => {
                error!(error = %e, "queue read failed, daemon exiting");
                return Err(e.into());
            }
        };
        if batch.is_empty() {
            continue;
        }

        ctx.stats.batches.fetch_add(1, Ordering::Relaxed);
        debug!(records = batch.len(), "processing batch");

        let failed = merge_batch(ctx, &batch);

        let requeued = match acknowledge(ctx, &batch, &failed) {
            Ok(requeued) => requeued,
            Err(e) => {
                error!(error = %e, "queue ack failed, daemon exiting");
                return Err(e.into());
            }
        };

        if requeued == 0 {
            requeue_rounds = 0;
            continue;
        }
        requeue_rounds = requeue_rounds.saturating_add(1);
        let pause = ctx.config.requeue_backoff(requeue_rounds);
        warn!(requeued, round = requeue_rounds, ?pause, "records requeued, backing off");
        if cancel.sleep(pause) {
            return Ok(());
        }
    }
}

/// Merge every distinct pair in `batch`; returns the pairs that failed.
fn merge_batch(ctx: &LoopContext, batch: &[QueuedAttribute]) -> HashSet<KeyspaceIndexPair> {
    let mut seen = HashSet::new();
    let pairs: Vec<KeyspaceIndexPair> = batch
        .iter()
        .map(|entry| entry.attribute.pair())
        .filter(|pair| seen.insert(pair.clone()))
        .collect();

    let mut failed = HashSet::new();
    for pair in pairs {
        match ctx.config.retry.run(|| deduplicate(ctx.sessions.as_ref(), &pair)) {
            Ok(outcome) => {
                ctx.stats.pairs_merged.fetch_add(1, Ordering::Relaxed);
                DaemonStats::add(&ctx.stats.duplicates_removed, outcome.removed.len());
            }
            Err(e) => {
                error!(
                    keyspace = pair.keyspace(),
                    value_index = pair.value_index(),
                    error = %e,
                    "deduplication failed"
                );
                ctx.stats.pairs_failed.fetch_add(1, Ordering::Relaxed);
                failed.insert(pair);
            }
        }
    }
    failed
}

/// Ack `batch`, first re-inserting failed records when the policy asks for
/// it. Returns how many records were re-inserted.
fn acknowledge(
    ctx: &LoopContext,
    batch: &[QueuedAttribute],
    failed: &HashSet<KeyspaceIndexPair>,
) -> Result<usize, QueueError> {
    let mut requeued = 0;
    if ctx.config.ack_policy == AckPolicy::RequeueFailed && !failed.is_empty() {
        for entry in batch.iter().filter(|e| failed.contains(&e.attribute.pair())) {
            let sequence = ctx.queue.insert(entry.attribute.clone())?;
            debug!(from = entry.sequence, to = sequence, "requeued record");
            requeued += 1;
        }
        DaemonStats::add(&ctx.stats.records_requeued, requeued);
    }

    ctx.queue.ack(batch)?;
    DaemonStats::add(&ctx.stats.records_acked, batch.len());
    Ok(requeued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::store::MemoryGraph;

    fn daemon(queue: Arc<MemoryQueue>, graph: &MemoryGraph) -> DedupDaemon {
        DedupDaemon::new(queue, Arc::new(graph.clone()), DaemonConfig::default()).unwrap()
    }

    #[test]
    fn test_config_validation() {
        let cfg = DaemonConfig {
            batch_size: 0,
            ..DaemonConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
        assert!(DaemonConfig::default().validate().is_ok());

        let cfg = DaemonConfig {
            requeue_delay: Duration::ZERO,
            ..DaemonConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "daemon.requeue_delay"
        ));
    }

    #[test]
    fn test_requeue_backoff_doubles_up_to_cap() {
        let cfg = DaemonConfig {
            requeue_delay: Duration::from_millis(100),
            max_requeue_delay: Duration::from_millis(350),
            ..DaemonConfig::default()
        };
        assert_eq!(cfg.requeue_backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.requeue_backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.requeue_backoff(3), Duration::from_millis(350));
        assert_eq!(cfg.requeue_backoff(u32::MAX), Duration::from_millis(350));
    }

    #[test]
    fn test_ack_policy_serde() {
        let cfg: DaemonConfig =
            serde_json::from_str(r#"{"ack_policy":"requeue_failed","requeue_delay":250}"#).unwrap();
        assert_eq!(cfg.ack_policy, AckPolicy::RequeueFailed);
        assert_eq!(cfg.requeue_delay, Duration::from_millis(250));
        assert_eq!(cfg.batch_size, 1000);
    }

    #[test]
    fn test_stop_without_start_is_ok() {
        let graph = MemoryGraph::new();
        let d = daemon(Arc::new(MemoryQueue::new()), &graph);
        assert!(d.stop().is_ok());
        assert_eq!(d.stats().workers_spawned, 0);
    }

    #[test]
    fn test_mark_only_enqueues() {
        let graph = MemoryGraph::new();
        let queue = Arc::new(MemoryQueue::new());
        let d = daemon(Arc::clone(&queue), &graph);

        assert_eq!(d.mark_for_deduplication("k", "ATTRIBUTE-name-v", VertexId(1)).unwrap(), 1);
        assert_eq!(d.mark_for_deduplication("k", "ATTRIBUTE-name-v", VertexId(2)).unwrap(), 2);
        assert_eq!(queue.pending().unwrap(), 2);
        assert_eq!(d.stats().batches, 0);
    }

    #[test]
    fn test_restart_after_stop() {
        let graph = MemoryGraph::new();
        let d = daemon(Arc::new(MemoryQueue::new()), &graph);

        let first = d.start().unwrap();
        d.stop().unwrap();
        assert!(first.is_finished());

        let second = d.start().unwrap();
        assert!(!second.is_finished());
        d.stop().unwrap();
        assert_eq!(d.stats().workers_spawned, 2);
    }

    #[test]
    fn test_closed_queue_ends_worker_cleanly() {
        let graph = MemoryGraph::new();
        let queue = Arc::new(MemoryQueue::new());
        let d = daemon(Arc::clone(&queue), &graph);

        let handle = d.start().unwrap();
        queue.close().unwrap();
        assert_eq!(handle.wait_timeout(Duration::from_secs(5)), Some(Ok(())));
    }
}
