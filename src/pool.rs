//! Priority-aware elastic worker pool.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────────────────────┐
//!                  │                PriorityPool                  │
//!                  │                                              │
//!  Submitters ─────┼──► gate check ──► tally.increment ──► push ──┤
//!  (any thread)    │    (CAS)                              │      │
//!                  │                                       ▼      │
//!                  │                 ┌───────────────────────────┐│
//!                  │                 │  PriorityQueue (min-heap) ││
//!                  │                 └────────────┬──────────────┘│
//!                  │                              ▼               │
//!                  │    Worker 0 … Worker N  (min..=max, elastic) │
//!                  │    pop → tally.decrement → run → settle      │
//!                  │                                              │
//!                  │  Shared: state gate, tally, live/idle counts │
//!                  └──────────────────────────────────────────────┘
//! ```
//!
//! # Correctness Invariants
//!
//! - **Priority dispatch**: the next item handed to a free worker has the
//!   numerically smallest level among queued items; equal levels are FIFO.
//! - **Drain on shutdown**: every accepted submission executes (or is skipped
//!   as cancelled) and resolves its handle; shutdown only stops intake.
//! - **Tally discipline**: increment before enqueue, decrement after dequeue
//!   and before the computation runs. `highest_pending_priority()` reads only
//!   the tally, never the queue.
//! - **Task isolation**: a failing or panicking computation resolves its own
//!   handle and affects no other task, the tally, or the queue.
//!
//! # Elasticity
//!
//! Standard elastic policy: `min_workers` stay available for the pool's
//! lifetime, growth up to `max_workers` while no worker is idle, and idle
//! workers above the minimum retire after `keep_alive` without work. The
//! growth check is an approximate heuristic over relaxed counters — a missed
//! grow is corrected on the next submission.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::handle::{handle_pair, BoxError, Promise, TaskError, TaskHandle};
use crate::priority::{Priority, TaskCategory};
use crate::queue::{Job, PriorityQueue};
use crate::tally::UrgencyTally;

// ============================================================================
// Configuration
// ============================================================================

/// Pool configuration.
///
/// Defaults derive from available hardware parallelism `C`:
/// `min_workers = max(1, C/2)`, `max_workers = max(1, C-1)`, 300 ms
/// keep-alive for idle workers above the minimum.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Always-available worker floor.
    pub min_workers: usize,
    /// Growth ceiling under load.
    pub max_workers: usize,
    /// Idle timeout after which workers above the floor retire. Also the
    /// worker's dequeue-wait granularity, so drain/exit checks run at least
    /// this often.
    pub keep_alive: Duration,
}

impl PoolConfig {
    /// Validate configuration. Panics on invalid values.
    pub fn validate(&self) {
        assert!(self.min_workers > 0, "min_workers must be > 0");
        assert!(
            self.max_workers >= self.min_workers,
            "max_workers must be >= min_workers"
        );
        assert!(self.keep_alive > Duration::ZERO, "keep_alive must be > 0");
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = thread::available_parallelism().map_or(1, usize::from);
        Self {
            min_workers: (cores / 2).max(1),
            max_workers: cores.saturating_sub(1).max(1),
            keep_alive: Duration::from_millis(300),
        }
    }
}

// ============================================================================
// Submission gate
// ============================================================================

// Combined pool state: `(outstanding_items << 1) | accepting_bit`.
//
// A single atomic eliminates the race between a submitter's "is the pool
// open" check and its item count increment: shutdown clears the bit, and any
// submission that won its CAS is guaranteed to be drained because workers
// only exit once the outstanding count reaches zero with the gate closed.
const ACCEPTING_BIT: usize = 1;
const COUNT_UNIT: usize = 2;

#[inline]
fn is_accepting(state: usize) -> bool {
    state & ACCEPTING_BIT != 0
}

#[inline]
fn outstanding(state: usize) -> usize {
    state >> 1
}

// ============================================================================
// Errors
// ============================================================================

/// Submission refused because the pool has begun shutdown.
///
/// Surfaced synchronously to the submitter, never silently dropped. (The
/// original design also rejected a null computation; Rust's closures make
/// that case unrepresentable.)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pool is shutting down; new submissions are rejected")]
pub struct RejectedError;

// ============================================================================
// Shared state
// ============================================================================

/// State shared between the pool owner, submitters, and workers.
///
/// # Invariants
///
/// - `live` counts spawned-and-not-exited workers; `min_workers <= live`
///   until drain (a retire never takes `live` below the floor).
/// - `state` outstanding count covers items enqueued or executing; workers
///   exit on `!accepting && outstanding == 0`.
struct PoolShared {
    cfg: PoolConfig,
    queue: PriorityQueue,
    tally: UrgencyTally,
    /// Combined accepting/outstanding gate. See [`ACCEPTING_BIT`].
    state: AtomicUsize,
    /// Spawned-and-not-exited worker count.
    live: AtomicUsize,
    /// Workers currently blocked waiting for an item. Approximate, used only
    /// by the growth heuristic.
    idle: AtomicUsize,
    next_worker_id: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolShared {
    /// CAS-claims one retirement slot above the worker floor.
    ///
    /// The claim is the `live` decrement itself, so concurrent retirements
    /// can never take the pool below `min_workers`.
    fn try_retire(&self) -> bool {
        let mut live = self.live.load(Ordering::Acquire);
        while live > self.cfg.min_workers {
            match self.live.compare_exchange_weak(
                live,
                live - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => live = actual,
            }
        }
        false
    }
}

// ============================================================================
// PriorityPool
// ============================================================================

/// Bounded elastic worker pool executing submissions in priority order.
///
/// # Lifecycle
///
/// 1. Create with [`PriorityPool::new`] (or `default()`); `min_workers`
///    threads start immediately.
/// 2. Submit computations from any number of threads; each returns a
///    [`TaskHandle`] synchronously.
/// 3. [`shutdown`](Self::shutdown) stops intake and lets the queue drain;
///    [`join`](Self::join) (or `Drop`) additionally waits for the drain.
pub struct PriorityPool {
    shared: Arc<PoolShared>,
}

impl Default for PriorityPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl PriorityPool {
    /// Creates the pool and starts `min_workers` workers.
    pub fn new(cfg: PoolConfig) -> Self {
        cfg.validate();

        let shared = Arc::new(PoolShared {
            cfg,
            queue: PriorityQueue::new(),
            tally: UrgencyTally::new(),
            // Initial state: accepting, no outstanding items.
            state: AtomicUsize::new(ACCEPTING_BIT),
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        });

        for _ in 0..cfg.min_workers {
            shared.live.fetch_add(1, Ordering::AcqRel);
            spawn_worker(Arc::clone(&shared));
        }
        debug!(
            min = cfg.min_workers,
            max = cfg.max_workers,
            "priority pool started"
        );

        Self { shared }
    }

    /// Submits a computation with the default category
    /// ([`TaskCategory::Other`]).
    ///
    /// # Errors
    ///
    /// Returns [`RejectedError`] if the pool has begun shutdown.
    pub fn submit<T, F>(&self, computation: F) -> Result<TaskHandle<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        self.submit_with_category(computation, TaskCategory::Other)
    }

    /// Submits a computation classified by a [`TaskCategory`].
    pub fn submit_with_category<T, F>(
        &self,
        computation: F,
        category: TaskCategory,
    ) -> Result<TaskHandle<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        self.submit_with_priority(computation, category.priority())
    }

    /// Submits a computation at an explicit priority level.
    ///
    /// Wraps the computation, increments the tally, enqueues, and returns the
    /// completion handle synchronously. Never blocks waiting for a worker —
    /// queue capacity is unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`RejectedError`] if the pool has begun shutdown.
    pub fn submit_with_priority<T, F>(
        &self,
        computation: F,
        priority: Priority,
    ) -> Result<TaskHandle<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        // CAS loop: atomically check accepting AND claim an outstanding slot.
        // A submission that wins this CAS is guaranteed to drain.
        let mut s = self.shared.state.load(Ordering::Acquire);
        loop {
            if !is_accepting(s) {
                return Err(RejectedError);
            }
            match self.shared.state.compare_exchange_weak(
                s,
                s.wrapping_add(COUNT_UNIT),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => s = actual,
            }
        }

        let (promise, handle) = handle_pair();
        let job = erase_job(computation, promise);

        // Increment strictly before enqueue: an observer must never see a
        // queued-but-uncounted item.
        self.shared.tally.increment(priority);
        self.shared.queue.push(job, priority);
        self.maybe_grow();

        Ok(handle)
    }

    /// The smallest priority level with submitted-but-not-started work, or
    /// `None` when nothing is pending.
    ///
    /// Delegates to the tally; an item currently executing is not counted.
    pub fn highest_pending_priority(&self) -> Option<Priority> {
        self.shared.tally.highest_pending()
    }

    /// Stops accepting new submissions. Idempotent, non-blocking.
    ///
    /// Already-queued items drain to completion; in-flight work is not
    /// interrupted. Callers wanting to wait for the drain use
    /// [`join`](Self::join) or await the completion handles.
    pub fn shutdown(&self) {
        let prev = self
            .shared
            .state
            .fetch_and(!ACCEPTING_BIT, Ordering::AcqRel);
        if !is_accepting(prev) {
            return;
        }
        self.shared.queue.close();
        debug!(
            queued = self.shared.queue.len(),
            "shutdown initiated; draining"
        );
    }

    /// Shuts down and blocks until every worker has exited (queue drained).
    pub fn join(self) {
        self.shutdown();
        self.join_workers();
    }

    /// Current number of live worker threads. Approximate under concurrent
    /// growth/retirement; bounded by `max_workers`.
    pub fn worker_count(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Spawns a worker when backlog exists and nobody is free to take it.
    ///
    /// The CAS on `live` is the spawn claim, so concurrent submitters can
    /// never overshoot `max_workers`. The idle check is an approximate
    /// heuristic over a relaxed counter — a missed grow is corrected by the
    /// next submission. A `live == 0` backlog (possible only around shutdown
    /// races or after worker deaths) always spawns so accepted items cannot
    /// be stranded.
    fn maybe_grow(&self) {
        let shared = &self.shared;
        let mut live = shared.live.load(Ordering::Acquire);
        loop {
            if live != 0
                && (live >= shared.cfg.max_workers
                    || shared.idle.load(Ordering::Relaxed) > 0
                    || shared.queue.is_empty())
            {
                return;
            }
            match shared
                .live
                .compare_exchange_weak(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => live = actual,
            }
        }
        spawn_worker(Arc::clone(shared));
    }

    fn join_workers(&self) {
        // A dying worker's replacement can register after we drained the
        // list, so loop until it stays empty.
        loop {
            let handles: Vec<_> = {
                let mut threads = self.shared.threads.lock().expect("threads mutex poisoned");
                threads.drain(..).collect()
            };
            if handles.is_empty() {
                return;
            }
            for th in handles {
                let _ = th.join();
            }
        }
    }
}

impl Drop for PriorityPool {
    fn drop(&mut self) {
        self.shutdown();
        self.join_workers();
    }
}

/// Wraps a typed computation into the type-erased queued job.
///
/// The job runs under panic capture: a produced value, a returned error, or a
/// panic all settle the promise and never cross the worker boundary. A handle
/// cancelled while queued skips execution entirely.
fn erase_job<T, F>(computation: F, promise: Promise<T>) -> Job
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    Box::new(move || {
        if promise.is_settled() {
            // Cancelled before start.
            return;
        }
        let outcome = match catch_unwind(AssertUnwindSafe(computation)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskError::Failed(Arc::new(err))),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };
        promise.settle(outcome);
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ============================================================================
// Worker lifecycle
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum ExitReason {
    /// Gate closed and all accepted items handled.
    Drained,
    /// Idle past keep-alive while above the worker floor.
    Retired,
}

/// Starts one worker thread. The caller has already accounted the `live`
/// slot this worker occupies.
fn spawn_worker(shared: Arc<PoolShared>) {
    let worker_id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);

    let th = thread::Builder::new()
        .name(format!("priopool-worker-{worker_id}"))
        .spawn({
            let shared = Arc::clone(&shared);
            move || worker_loop(&shared, worker_id)
        })
        .expect("failed to spawn worker thread");

    let mut threads = shared.threads.lock().expect("threads mutex poisoned");
    // Reap handles of workers that already exited; elastic churn would
    // otherwise accumulate one finished handle per grow cycle for the
    // pool's lifetime.
    threads.retain(|t| !t.is_finished());
    threads.push(th);
    drop(threads);
    debug!(worker_id, "worker spawned");
}

/// Replaces a worker that unwinds outside the panic-captured computation
/// region, so one dead thread cannot strand queued items.
struct WorkerSentinel {
    shared: Arc<PoolShared>,
    worker_id: usize,
    armed: bool,
}

impl Drop for WorkerSentinel {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let s = self.shared.state.load(Ordering::Acquire);
        if is_accepting(s) || outstanding(s) > 0 {
            warn!(
                worker_id = self.worker_id,
                "worker died unexpectedly; spawning replacement"
            );
            // The replacement inherits this worker's `live` slot.
            spawn_worker(Arc::clone(&self.shared));
        } else {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Releases one outstanding-item slot when dropped.
///
/// A drop guard so the slot is released even when the job unwinds outside
/// its panic-captured region; a leaked count would stall the drain forever.
/// The worker finishing the last item of a shutdown drain wakes its parked
/// siblings so they rerun their exit checks.
struct OutstandingSlot<'a> {
    shared: &'a PoolShared,
}

impl Drop for OutstandingSlot<'_> {
    fn drop(&mut self) {
        let prev = self.shared.state.fetch_sub(COUNT_UNIT, Ordering::AcqRel);
        if !is_accepting(prev) && outstanding(prev) == 1 {
            self.shared.queue.wake_all();
        }
    }
}

/// Main worker loop.
///
/// ```text
/// loop {
///     pop_timeout(keep_alive)
///       item  → tally.decrement → run (panic-captured) → count--
///       none  → gate closed && outstanding == 0  → exit (drained)
///               gate closed && outstanding > 0   → park, recheck
///               gate open   && live > min        → exit (retired)
/// }
/// ```
///
/// The tally decrement sits strictly between queue removal and the
/// computation: `highest_pending_priority()` observers never see a zero count
/// for a level with a not-yet-started item, nor a stale nonzero count for an
/// item already executing.
fn worker_loop(shared: &Arc<PoolShared>, worker_id: usize) {
    let mut sentinel = WorkerSentinel {
        shared: Arc::clone(shared),
        worker_id,
        armed: true,
    };

    let exit = loop {
        shared.idle.fetch_add(1, Ordering::Relaxed);
        let popped = shared.queue.pop_timeout(shared.cfg.keep_alive);
        shared.idle.fetch_sub(1, Ordering::Relaxed);

        match popped {
            Some(item) => {
                shared.tally.decrement(item.priority());
                let _slot = OutstandingSlot {
                    shared: shared.as_ref(),
                };
                item.run();
            }
            None => {
                let s = shared.state.load(Ordering::Acquire);
                if !is_accepting(s) {
                    if outstanding(s) == 0 {
                        break ExitReason::Drained;
                    }
                    // Drain tail: a sibling is still running the last items.
                    // Park on the queue condvar rather than spin; the sibling
                    // wakes us when the count hits zero, with the keep-alive
                    // as a recheck fallback.
                    shared.queue.wait_activity(shared.cfg.keep_alive);
                } else if shared.try_retire() {
                    break ExitReason::Retired;
                }
            }
        }
    };

    sentinel.armed = false;
    if exit == ExitReason::Drained {
        shared.live.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(worker_id, ?exit, "worker exiting");
}

// ============================================================================
// Tests
// ============================================================================
