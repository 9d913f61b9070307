//! Request admission, batching and dispatch.
//!
//! [`RequestBatcher::submit`] is non-blocking: it answers from the
//! [`FastPathCache`] when it can and otherwise places a [`WorkItem`] on the
//! priority [`WorkQueue`]. [`RequestBatcher::run`] is the collection loop. It
//! assembles batches bounded by size and time, runs single items inline and
//! fans multi-item batches out over the [`WorkerPool`]. Every item's outcome
//! is delivered to its own [`WorkHandle`] as soon as it is ready.
//!
//! ## Item lifecycle
//!
//! `Enqueued → InBatch → Dispatched → Completed | Failed | TimedOut`
//!
//! An item whose deadline passes while enqueued or in a batch receives
//! [`BatchError::TimedOut`] and never reaches the synthesizer. An item whose
//! handle was dropped before dispatch is discarded.

pub mod pool;
pub mod queue;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use pool::{PoolPermit, WorkerPool};
pub use queue::{Priority, QueueError, QueueStats, WorkItem, WorkQueue};

use crate::cache::{FastPathCache, Fingerprint};
use crate::config::BatchingConfig;
use crate::memory::PressureLevel;
use crate::metrics::GovernorMetrics;
use crate::synth::{SynthesisOutput, SynthesisRequest, Synthesizer};
use crate::telemetry::{Outcome, TelemetryAggregator};
use crate::panic_message;

/// Per-item failure delivered through a [`WorkHandle`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    /// Refused at admission because the queue is above its high-water mark.
    #[error("rejected: overloaded")]
    Overloaded,
    /// Deadline passed before the item was dispatched.
    #[error("timed out before dispatch")]
    TimedOut,
    /// The synthesizer ran and failed.
    #[error("synthesis failed: {0}")]
    Synthesis(String),
    /// Removed by [`RequestBatcher::cancel`].
    #[error("cancelled")]
    Cancelled,
    /// The batcher stopped before the item was dispatched.
    #[error("batcher shut down")]
    Shutdown,
    /// The result sink vanished without an outcome.
    #[error("result dropped")]
    Dropped,
}

/// Successful result of one work item.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Synthesized output, shared with the cache when cached.
    pub output: Arc<SynthesisOutput>,
    /// Served from the fast-path cache.
    pub cache_hit: bool,
    /// Finished after its deadline.
    pub late: bool,
    /// Time from admission to dispatch.
    pub queue_wait: Duration,
    /// Time spent in the synthesizer.
    pub processing: Duration,
}

impl Completion {
    fn from_cache(output: Arc<SynthesisOutput>, queue_wait: Duration) -> Self {
        Self {
            output,
            cache_hit: true,
            late: false,
            queue_wait,
            processing: Duration::ZERO,
        }
    }
}

/// A request plus its scheduling parameters.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    request: SynthesisRequest,
    priority: Priority,
    timeout: Option<Duration>,
}

impl WorkRequest {
    /// Normal priority, no deadline.
    pub fn new(request: SynthesisRequest) -> Self {
        Self {
            request,
            priority: Priority::NORMAL,
            timeout: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Give the item a deadline `timeout` after admission.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The wrapped request.
    pub fn request(&self) -> &SynthesisRequest {
        &self.request
    }
}

impl From<SynthesisRequest> for WorkRequest {
    fn from(request: SynthesisRequest) -> Self {
        Self::new(request)
    }
}

/// Caller's side of a submitted item.
///
/// Dropping the handle before dispatch cancels the item.
#[derive(Debug)]
pub struct WorkHandle {
    id: Uuid,
    rx: oneshot::Receiver<Result<Completion, BatchError>>,
}

impl WorkHandle {
    /// Item id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the item's outcome.
    pub async fn outcome(self) -> Result<Completion, BatchError> {
        self.rx.await.unwrap_or(Err(BatchError::Dropped))
    }
}

/// Counters exposed by [`RequestBatcher::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    /// Items waiting in the queue.
    pub queue_depth: usize,
    /// Batches handed to dispatch since start.
    pub batches_dispatched: u64,
    /// Items that went through the synthesizer.
    pub items_dispatched: u64,
    /// Current worker pool size.
    pub pool_size: usize,
}

struct Inner {
    queue: WorkQueue,
    synthesizer: Arc<dyn Synthesizer>,
    cache: Arc<FastPathCache>,
    telemetry: Arc<TelemetryAggregator>,
    pool: WorkerPool,
    pressure: watch::Receiver<PressureLevel>,
    metrics: Option<Arc<GovernorMetrics>>,
    max_batch_size: usize,
    batch_timeout: Duration,
    batches_dispatched: AtomicU64,
    items_dispatched: AtomicU64,
}

/// Builder for [`RequestBatcher`].
pub struct BatcherBuilder {
    config: BatchingConfig,
    synthesizer: Arc<dyn Synthesizer>,
    cache: Option<Arc<FastPathCache>>,
    telemetry: Option<Arc<TelemetryAggregator>>,
    pool: Option<WorkerPool>,
    pressure: Option<watch::Receiver<PressureLevel>>,
    metrics: Option<Arc<GovernorMetrics>>,
    preallocate: usize,
}

impl BatcherBuilder {
    /// Share an existing cache.
    pub fn cache(mut self, cache: Arc<FastPathCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Record outcomes into `telemetry`.
    pub fn telemetry(mut self, telemetry: Arc<TelemetryAggregator>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Dispatch multi-item batches over `pool`.
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Follow memory pressure for batch sizing.
    pub fn pressure(mut self, pressure: watch::Receiver<PressureLevel>) -> Self {
        self.pressure = Some(pressure);
        self
    }

    /// Report queue depth to `metrics`.
    pub fn metrics(mut self, metrics: Arc<GovernorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Reserve queue storage for `n` items.
    pub fn preallocate(mut self, n: usize) -> Self {
        self.preallocate = n;
        self
    }

    /// Finish construction.
    pub fn build(self) -> RequestBatcher {
        let pool = self
            .pool
            .unwrap_or_else(|| WorkerPool::new(self.config.worker_count.unwrap_or(1)));
        let pressure = self
            .pressure
            .unwrap_or_else(|| watch::channel(PressureLevel::Normal).1);
        let preallocate = self.preallocate.min(self.config.high_water_mark);
        RequestBatcher {
            inner: Arc::new(Inner {
                queue: WorkQueue::new(self.config.high_water_mark, preallocate),
                synthesizer: self.synthesizer,
                cache: self.cache.unwrap_or_default(),
                telemetry: self.telemetry.unwrap_or_default(),
                pool,
                pressure,
                metrics: self.metrics,
                max_batch_size: self.config.max_batch_size.max(1),
                batch_timeout: self.config.batch_timeout(),
                batches_dispatched: AtomicU64::new(0),
                items_dispatched: AtomicU64::new(0),
            }),
        }
    }
}

/// Admission, collection and dispatch of synthesis work.
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<Inner>,
}

impl RequestBatcher {
    /// Start building a batcher around `synthesizer`.
    pub fn builder(config: &BatchingConfig, synthesizer: Arc<dyn Synthesizer>) -> BatcherBuilder {
        BatcherBuilder {
            config: config.clone(),
            synthesizer,
            cache: None,
            telemetry: None,
            pool: None,
            pressure: None,
            metrics: None,
            preallocate: 0,
        }
    }

    /// Admit a request without blocking.
    ///
    /// A cache hit resolves the returned handle immediately.
    ///
    /// # Errors
    ///
    /// [`BatchError::Overloaded`] when a sheddable item meets the high-water
    /// mark; [`BatchError::Shutdown`] once the run loop has stopped.
    pub fn submit(&self, work: WorkRequest) -> Result<WorkHandle, BatchError> {
        let inner = &self.inner;
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        let fingerprint = inner
            .cache
            .is_eligible(&work.request)
            .then(|| Fingerprint::of(&work.request));

        if let Some(output) = fingerprint.and_then(|fp| inner.cache.get(&fp)) {
            debug!(%id, "fast-path hit at admission");
            inner
                .telemetry
                .record(Outcome::cache_hit(output.output_duration));
            let _ = tx.send(Ok(Completion::from_cache(output, Duration::ZERO)));
            return Ok(WorkHandle { id, rx });
        }

        let now = Instant::now();
        let item = WorkItem {
            id,
            request: work.request,
            priority: work.priority,
            enqueued_at: now,
            deadline: work.timeout.map(|t| now + t),
            fingerprint,
            sink: tx,
        };

        match inner.queue.push(item) {
            Ok(depth) => {
                self.report_depth(depth);
                Ok(WorkHandle { id, rx })
            }
            Err(QueueError::Overloaded) => {
                warn!(%id, priority = %work.priority, "rejected: overloaded");
                inner.telemetry.record(Outcome::rejected());
                Err(BatchError::Overloaded)
            }
            Err(QueueError::Closed) => Err(BatchError::Shutdown),
        }
    }

    /// Remove a still-queued item, failing it with [`BatchError::Cancelled`].
    ///
    /// Returns `false` if the item already left the queue.
    pub fn cancel(&self, id: Uuid) -> bool {
        let taken = self.inner.queue.take_if(|item| item.id == id);
        let found = !taken.is_empty();
        for item in taken {
            let _ = item.sink.send(Err(BatchError::Cancelled));
        }
        if found {
            debug!(%id, "queued item cancelled");
            self.report_depth(self.inner.queue.len());
        }
        found
    }

    /// Items waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    /// Queue depth per priority.
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Dispatch counters.
    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            queue_depth: self.inner.queue.len(),
            batches_dispatched: self.inner.batches_dispatched.load(Ordering::Relaxed),
            items_dispatched: self.inner.items_dispatched.load(Ordering::Relaxed),
            pool_size: self.inner.pool.size(),
        }
    }

    /// The worker pool multi-item batches run on.
    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Batch size bound in effect right now.
    pub fn effective_max_batch_size(&self) -> usize {
        let max = self.inner.max_batch_size;
        if *self.inner.pressure.borrow() == PressureLevel::Severe {
            (max / 2).max(1)
        } else {
            max
        }
    }

    /// Collection loop. Runs until `shutdown` turns `true`, then fails every
    /// still-queued item with [`BatchError::Shutdown`].
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_batch_size = self.inner.max_batch_size,
            batch_timeout_ms = self.inner.batch_timeout.as_millis() as u64,
            "request batcher started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = self.inner.queue.wait_nonempty() => {}
            }

            self.reap_queued();
            let batch = self.collect().await;
            if !batch.is_empty() {
                self.dispatch(batch).await;
            }
        }

        self.inner.queue.close();
        let remaining = self.inner.queue.drain();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "failing queued items on shutdown");
        }
        for item in remaining {
            let _ = item.sink.send(Err(BatchError::Shutdown));
        }
        self.report_depth(0);
        info!("request batcher stopped");
    }

    /// Fail expired items and drop abandoned ones without waiting for them to
    /// reach the head of the queue.
    fn reap_queued(&self) {
        let now = Instant::now();
        let stale = self
            .inner
            .queue
            .take_if(|item| item.is_abandoned() || item.is_expired(now));
        for item in stale {
            self.retire(item, now);
        }
    }

    /// Pull items for one batch.
    async fn collect(&self) -> Vec<WorkItem> {
        let max = self.effective_max_batch_size();
        let window_end = tokio::time::Instant::now() + self.inner.batch_timeout;
        let mut batch = Vec::with_capacity(max);

        while batch.len() < max {
            match self.inner.queue.pop() {
                Some(item) => {
                    if let Some(item) = self.check_live(item) {
                        batch.push(item);
                    }
                }
                None if !batch.is_empty() => break,
                None => {
                    tokio::select! {
                        _ = self.inner.queue.wait_nonempty() => {}
                        _ = tokio::time::sleep_until(window_end) => break,
                    }
                }
            }
            if tokio::time::Instant::now() >= window_end {
                break;
            }
        }
        if !batch.is_empty() {
            self.report_depth(self.inner.queue.len());
        }
        batch
    }

    /// `Some(item)` if it should still run; otherwise resolves it.
    fn check_live(&self, item: WorkItem) -> Option<WorkItem> {
        let now = Instant::now();
        if item.is_abandoned() || item.is_expired(now) {
            self.retire(item, now);
            None
        } else {
            Some(item)
        }
    }

    fn retire(&self, item: WorkItem, now: Instant) {
        if item.is_abandoned() {
            debug!(id = %item.id, "handle dropped before dispatch");
            return;
        }
        let queue_wait = now.saturating_duration_since(item.enqueued_at);
        debug!(id = %item.id, ?queue_wait, "deadline passed before dispatch");
        self.inner.telemetry.record(Outcome::timed_out(queue_wait));
        let _ = item.sink.send(Err(BatchError::TimedOut));
    }

    /// [`check_live`](Self::check_live), then answer from the cache if
    /// another batch produced the result meanwhile.
    fn resolve_early(&self, item: WorkItem) -> Option<WorkItem> {
        let item = self.check_live(item)?;
        let Some(output) = item.fingerprint.and_then(|fp| self.inner.cache.get(&fp)) else {
            return Some(item);
        };
        let queue_wait = item.enqueued_at.elapsed();
        self.inner
            .telemetry
            .record(Outcome::cache_hit(output.output_duration).with_queue_wait(queue_wait));
        let _ = item.sink.send(Ok(Completion::from_cache(output, queue_wait)));
        None
    }

    async fn dispatch(&self, batch: Vec<WorkItem>) {
        let mut live: Vec<WorkItem> = batch
            .into_iter()
            .filter_map(|item| self.resolve_early(item))
            .collect();
        if live.is_empty() {
            return;
        }

        let batch_no = self.inner.batches_dispatched.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .items_dispatched
            .fetch_add(live.len() as u64, Ordering::Relaxed);
        debug!(batch = batch_no, size = live.len(), "dispatching batch");

        if live.len() == 1 {
            if let Some(item) = live.pop() {
                self.run_item(item).await;
            }
            return;
        }

        for item in live {
            let permit = match self.inner.pool.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    let _ = item.sink.send(Err(BatchError::Shutdown));
                    continue;
                }
            };
            // Waiting for a worker can outlast the deadline or the caller.
            let Some(item) = self.resolve_early(item) else {
                drop(permit);
                continue;
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.run_item(item).await;
                drop(permit);
            });
        }
    }

    async fn run_item(&self, item: WorkItem) {
        let WorkItem {
            id,
            request,
            enqueued_at,
            deadline,
            fingerprint,
            sink,
            ..
        } = item;
        let started = Instant::now();
        let queue_wait = started.saturating_duration_since(enqueued_at);

        let result = AssertUnwindSafe(self.inner.synthesizer.synthesize(&request))
            .catch_unwind()
            .await;
        let processing = started.elapsed();
        let late = deadline.is_some_and(|d| Instant::now() > d);

        let outcome = match result {
            Ok(Ok(output)) => {
                let output = Arc::new(output);
                if let Some(fp) = fingerprint {
                    self.inner.cache.put(fp, Arc::clone(&output));
                }
                self.inner.telemetry.record(
                    Outcome::succeeded(processing, output.output_duration)
                        .with_queue_wait(queue_wait)
                        .with_late(late),
                );
                Ok(Completion {
                    output,
                    cache_hit: false,
                    late,
                    queue_wait,
                    processing,
                })
            }
            Ok(Err(e)) => {
                warn!(%id, error = %e, "synthesis failed");
                self.inner.telemetry.record(
                    Outcome::failed(processing)
                        .with_queue_wait(queue_wait)
                        .with_late(late),
                );
                Err(BatchError::Synthesis(e.to_string()))
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                warn!(%id, panic = %msg, "synthesizer panicked");
                self.inner.telemetry.record(
                    Outcome::failed(processing)
                        .with_queue_wait(queue_wait)
                        .with_late(late),
                );
                Err(BatchError::Synthesis(format!("synthesizer panicked: {msg}")))
            }
        };

        if sink.send(outcome).is_err() {
            debug!(%id, "caller went away before completion");
        }
    }

    fn report_depth(&self, depth: usize) {
        if let Some(m) = &self.inner.metrics {
            m.set_queue_depth(depth);
        }
    }
}
