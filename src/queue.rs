//! Priority-ordered blocking queue of submitted work items.
//!
//! A [`WorkItem`] is the queued form of one submission: the type-erased job
//! closure, its priority level, and a monotonic sequence number. Ordering is
//! strict priority first (smaller level dispatched first), FIFO among equal
//! levels via the sequence number — deterministic tie-break by arrival order.
//!
//! The queue never blocks producers (capacity is unbounded, limited only by
//! memory); consumers block with a timeout. `close()` wakes every blocked
//! consumer so drain/exit checks run promptly.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::priority::Priority;

/// Type-erased queued job. Runs the computation and resolves its handle.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// One queued unit of work. Owned exclusively by the queue until dequeued by
/// exactly one worker.
pub(crate) struct WorkItem {
    job: Job,
    priority: Priority,
    seq: u64,
}

impl WorkItem {
    /// Priority level, immutable after creation.
    #[inline]
    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    /// Consumes the item and runs its job.
    pub(crate) fn run(self) {
        (self.job)()
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    /// `BinaryHeap` is a max-heap; the comparison is inverted so the smallest
    /// `(level, seq)` pair surfaces first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    heap: BinaryHeap<WorkItem>,
    next_seq: u64,
    closed: bool,
}

/// Mutex-guarded binary heap with condvar wakeups.
///
/// # Thread Safety
///
/// Many concurrent producers and consumers. Producers push and wake one
/// consumer; consumers block up to a timeout when empty.
pub(crate) struct PriorityQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl PriorityQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues a job. Never blocks the caller waiting for a worker.
    pub(crate) fn push(&self, job: Job, priority: Priority) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(WorkItem { job, priority, seq });
        drop(inner);
        self.available.notify_one();
    }

    /// Dequeues the single most urgent available item, blocking up to
    /// `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout, or immediately once the queue is closed and
    /// empty. Remaining items are still handed out after `close()` — drain
    /// semantics.
    pub(crate) fn pop_timeout(&self, timeout: Duration) -> Option<WorkItem> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        loop {
            if let Some(item) = inner.heap.pop() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _timed_out) = self
                .available
                .wait_timeout(inner, deadline - now)
                .expect("queue mutex poisoned");
            inner = guard;
        }
    }

    /// Marks the queue closed and wakes every blocked consumer.
    ///
    /// Closing does not discard items; consumers keep popping until empty.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    /// Blocks up to `timeout` while the queue is empty.
    ///
    /// Workers waiting out a shutdown drain park here instead of spinning on
    /// an empty closed queue. Returns on push, [`wake_all`](Self::wake_all),
    /// timeout, or a spurious wakeup; the caller rechecks its exit conditions.
    pub(crate) fn wait_activity(&self, timeout: Duration) {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        if inner.heap.is_empty() {
            let _ = self
                .available
                .wait_timeout(inner, timeout)
                .expect("queue mutex poisoned");
        }
    }

    /// Wakes every blocked consumer without enqueueing anything.
    ///
    /// Used when the last outstanding item of a drain finishes, so parked
    /// workers rerun their exit checks promptly.
    pub(crate) fn wake_all(&self) {
        self.available.notify_all();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
