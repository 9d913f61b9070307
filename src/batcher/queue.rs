//! Priority admission queue.
//!
//! Items are ordered by priority (higher first) and then by admission
//! sequence (FIFO within a priority). Above the high-water mark, items below
//! [`Priority::HIGH`] are refused instead of queued.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::debug;
use uuid::Uuid;

use super::{BatchError, Completion};
use crate::cache::Fingerprint;
use crate::synth::SynthesisRequest;

/// Request priority. Larger values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    /// Background work; first to be refused under overload.
    pub const LOW: Priority = Priority(0);
    /// Default priority.
    pub const NORMAL: Priority = Priority(1);
    /// Never refused by the high-water mark.
    pub const HIGH: Priority = Priority(5);
    /// Highest named priority.
    pub const CRITICAL: Priority = Priority(10);

    /// Parse a priority level from a name string (`"low"`, `"normal"`,
    /// `"high"`, `"critical"`).
    ///
    /// Returns `None` for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Priority::LOW),
            "normal" => Some(Priority::NORMAL),
            "high" => Some(Priority::HIGH),
            "critical" => Some(Priority::CRITICAL),
            _ => None,
        }
    }

    /// Whether the high-water mark may refuse this priority.
    pub fn is_sheddable(self) -> bool {
        self < Priority::HIGH
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel half that receives an item's outcome.
pub type ResultSink = oneshot::Sender<Result<Completion, BatchError>>;

/// One admitted unit of work, owned by the batcher until completion.
#[derive(Debug)]
pub struct WorkItem {
    /// Unique id, also carried by the caller's handle.
    pub id: Uuid,
    /// Payload.
    pub request: SynthesisRequest,
    /// Scheduling priority.
    pub priority: Priority,
    /// Admission time.
    pub enqueued_at: Instant,
    /// Optional completion deadline.
    pub deadline: Option<Instant>,
    /// Cache key, present only for cache-eligible requests.
    pub fingerprint: Option<Fingerprint>,
    /// Where the outcome is delivered.
    pub sink: ResultSink,
}

impl WorkItem {
    /// Whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Whether the caller dropped its handle.
    pub fn is_abandoned(&self) -> bool {
        self.sink.is_closed()
    }
}

struct Queued {
    priority: Priority,
    sequence: u64,
    item: WorkItem,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (FIFO)
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

/// Why an item was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Depth is at the high-water mark and the item is sheddable.
    Overloaded,
    /// The queue no longer accepts items.
    Closed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Overloaded => write!(f, "queue above high-water mark"),
            QueueError::Closed => write!(f, "queue closed"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Queue depth broken down by priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items currently queued.
    pub total: usize,
    /// Count per priority value.
    pub by_priority: BTreeMap<i32, usize>,
}

/// Locked binary heap with a wakeup for the collection loop.
pub struct WorkQueue {
    heap: Mutex<BinaryHeap<Queued>>,
    sequence: AtomicU64,
    notify: Notify,
    high_water_mark: usize,
    closed: AtomicBool,
}

impl WorkQueue {
    /// Queue that sheds low-priority items at `high_water_mark`, with room
    /// for `preallocate` items reserved up front.
    pub fn new(high_water_mark: usize, preallocate: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::with_capacity(preallocate)),
            sequence: AtomicU64::new(0),
            notify: Notify::new(),
            high_water_mark,
            closed: AtomicBool::new(false),
        }
    }

    /// Admit an item. Returns the new depth.
    ///
    /// # Errors
    ///
    /// [`QueueError::Overloaded`] for sheddable items at the high-water mark,
    /// [`QueueError::Closed`] after [`close`](Self::close).
    pub fn push(&self, item: WorkItem) -> Result<usize, QueueError> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(QueueError::Closed);
        }
        let depth = {
            let mut heap = self.heap.lock();
            if heap.len() >= self.high_water_mark && item.priority.is_sheddable() {
                debug!(
                    priority = %item.priority,
                    queue_size = heap.len(),
                    "item shed at high-water mark"
                );
                return Err(QueueError::Overloaded);
            }
            let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(
                id = %item.id,
                priority = %item.priority,
                sequence,
                queue_size = heap.len() + 1,
                "item enqueued"
            );
            heap.push(Queued {
                priority: item.priority,
                sequence,
                item,
            });
            heap.len()
        };
        self.notify.notify_one();
        Ok(depth)
    }

    /// Remove the highest-priority item.
    pub fn pop(&self) -> Option<WorkItem> {
        self.heap.lock().pop().map(|q| q.item)
    }

    /// Remove every item matching `pred`, preserving the order of the rest.
    pub fn take_if<F>(&self, mut pred: F) -> Vec<WorkItem>
    where
        F: FnMut(&WorkItem) -> bool,
    {
        let mut heap = self.heap.lock();
        if !heap.iter().any(|q| pred(&q.item)) {
            return Vec::new();
        }
        let (taken, kept): (Vec<Queued>, Vec<Queued>) =
            std::mem::take(&mut *heap).into_iter().partition(|q| pred(&q.item));
        *heap = kept.into_iter().collect();
        taken.into_iter().map(|q| q.item).collect()
    }

    /// Remove all items in priority order.
    pub fn drain(&self) -> Vec<WorkItem> {
        let heap = std::mem::take(&mut *self.heap.lock());
        heap.into_sorted_vec()
            .into_iter()
            .rev()
            .map(|q| q.item)
            .collect()
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Whether no items are queued.
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Depth per priority.
    pub fn stats(&self) -> QueueStats {
        let heap = self.heap.lock();
        let mut stats = QueueStats {
            total: heap.len(),
            by_priority: BTreeMap::new(),
        };
        for q in heap.iter() {
            *stats.by_priority.entry(q.priority.0).or_insert(0) += 1;
        }
        stats
    }

    /// Wait until an item is queued or the queue is closed.
    pub async fn wait_nonempty(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() || self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Refuse further pushes and wake any waiter.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn item(text: &str, priority: Priority) -> (WorkItem, oneshot::Receiver<Result<Completion, BatchError>>) {
        let (tx, rx) = oneshot::channel();
        (
            WorkItem {
                id: Uuid::new_v4(),
                request: SynthesisRequest::new(text, "af"),
                priority,
                enqueued_at: Instant::now(),
                deadline: None,
                fingerprint: None,
                sink: tx,
            },
            rx,
        )
    }

    fn push(q: &WorkQueue, text: &str, p: Priority) -> oneshot::Receiver<Result<Completion, BatchError>> {
        let (i, rx) = item(text, p);
        q.push(i).expect("test: push");
        rx
    }

    #[test]
    fn test_priority_ordering() {
        let q = WorkQueue::new(100, 0);
        let _a = push(&q, "a", Priority(1));
        let _b = push(&q, "b", Priority(5));
        let _c = push(&q, "c", Priority(1));
        let order: Vec<String> = std::iter::from_fn(|| q.pop())
            .map(|i| i.request.text)
            .collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let q = WorkQueue::new(100, 0);
        let _rx: Vec<_> = (0..5).map(|i| push(&q, &i.to_string(), Priority::NORMAL)).collect();
        let order: Vec<String> = std::iter::from_fn(|| q.pop())
            .map(|i| i.request.text)
            .collect();
        assert_eq!(order, vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn test_high_water_mark_sheds_low_priority_only() {
        let q = WorkQueue::new(2, 2);
        let _r1 = push(&q, "1", Priority::LOW);
        let _r2 = push(&q, "2", Priority::NORMAL);

        let (low, _rl) = item("low", Priority::LOW);
        assert_eq!(q.push(low), Err(QueueError::Overloaded));
        let (normal, _rn) = item("normal", Priority::NORMAL);
        assert_eq!(q.push(normal), Err(QueueError::Overloaded));

        let (high, _rh) = item("high", Priority::HIGH);
        assert_eq!(q.push(high), Ok(3));
        let (crit, _rc) = item("crit", Priority::CRITICAL);
        assert_eq!(q.push(crit), Ok(4));
    }

    #[test]
    fn test_closed_queue_refuses_pushes() {
        let q = WorkQueue::new(10, 0);
        q.close();
        let (i, _rx) = item("x", Priority::CRITICAL);
        assert_eq!(q.push(i), Err(QueueError::Closed));
    }

    #[test]
    fn test_take_if_removes_matching_and_keeps_order() {
        let q = WorkQueue::new(10, 0);
        let _r: Vec<_> = ["a", "drop1", "b", "drop2", "c"]
            .iter()
            .map(|t| push(&q, t, Priority::NORMAL))
            .collect();
        let taken = q.take_if(|i| i.request.text.starts_with("drop"));
        assert_eq!(taken.len(), 2);
        let rest: Vec<String> = std::iter::from_fn(|| q.pop())
            .map(|i| i.request.text)
            .collect();
        assert_eq!(rest, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_drain_returns_priority_order() {
        let q = WorkQueue::new(10, 0);
        let _r1 = push(&q, "low", Priority::LOW);
        let _r2 = push(&q, "crit", Priority::CRITICAL);
        let _r3 = push(&q, "norm", Priority::NORMAL);
        let drained: Vec<String> = q.drain().into_iter().map(|i| i.request.text).collect();
        assert_eq!(drained, vec!["crit", "norm", "low"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_stats_counts_by_priority() {
        let q = WorkQueue::new(10, 0);
        let _r1 = push(&q, "a", Priority::HIGH);
        let _r2 = push(&q, "b", Priority::HIGH);
        let _r3 = push(&q, "c", Priority::LOW);
        let stats = q.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_priority.get(&5), Some(&2));
        assert_eq!(stats.by_priority.get(&0), Some(&1));
    }

    #[test]
    fn test_item_expiry_and_abandonment() {
        let (mut i, rx) = item("x", Priority::NORMAL);
        let now = Instant::now();
        assert!(!i.is_expired(now));
        i.deadline = Some(now);
        assert!(i.is_expired(now));
        assert!(!i.is_abandoned());
        drop(rx);
        assert!(i.is_abandoned());
    }

    #[test]
    fn test_priority_from_name() {
        assert_eq!(Priority::from_name("HIGH"), Some(Priority::HIGH));
        assert_eq!(Priority::from_name("critical"), Some(Priority::CRITICAL));
        assert_eq!(Priority::from_name("urgent"), None);
        assert_eq!(Priority::default(), Priority::NORMAL);
        assert!(Priority::NORMAL.is_sheddable());
        assert!(!Priority::HIGH.is_sheddable());
    }

    #[tokio::test]
    async fn test_wait_nonempty_wakes_on_push() {
        let q = Arc::new(WorkQueue::new(10, 0));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_nonempty().await })
        };
        tokio::task::yield_now().await;
        let _rx = push(&q, "x", Priority::NORMAL);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("test: woke before timeout")
            .expect("test: join");
    }

    #[tokio::test]
    async fn test_wait_nonempty_returns_when_closed() {
        let q = Arc::new(WorkQueue::new(10, 0));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.wait_nonempty().await })
        };
        tokio::task::yield_now().await;
        q.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("test: woke before timeout")
            .expect("test: join");
    }
}
