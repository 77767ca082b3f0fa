//! Lock-free per-level count of submitted-but-not-yet-started work.
//!
//! The tally answers "what is the most urgent pending priority right now"
//! without scanning the queue. One counter per level, index = level − 1.
//!
//! # Invariants
//! - `counts[i] >= 0` at every observable instant; `counts[i]` equals the
//!   number of items at level `i + 1` that have been enqueued but not yet
//!   picked up by a worker.
//! - Increment happens before the enqueue; decrement happens strictly after
//!   the dequeue and strictly before the computation starts.
//! - Instance-owned: each pool owns its own tally, no cross-pool sharing.
//!
//! # Ordering
//! All atomic operations use `Relaxed`. The tally is pure accounting:
//! - `fetch_add`/`fetch_sub` atomicity rules out torn or lost counts.
//! - Nothing reads data "published" by a tally update, so no acquire/release
//!   edge is needed.
//! - `highest_pending` is a snapshot: counters are read one at a time, and a
//!   concurrent increment/decrement may or may not be reflected. Each counter
//!   read is itself atomic, never torn.
//!
//! # Performance
//! - `increment`, `decrement` are O(1); `highest_pending` is O(MAX_LEVELS).
//! - Counters are cache-line padded so concurrent submitters and workers
//!   touching different levels do not false-share.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use crate::priority::{Priority, MAX_LEVELS};

/// Concurrency-safe per-priority-level pending counters.
pub struct UrgencyTally {
    counts: [CachePadded<AtomicU32>; MAX_LEVELS],
}

impl std::fmt::Debug for UrgencyTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for c in &self.counts {
            list.entry(&c.load(Ordering::Relaxed));
        }
        list.finish()
    }
}

impl Default for UrgencyTally {
    fn default() -> Self {
        Self::new()
    }
}

impl UrgencyTally {
    /// Creates a tally with all counts zero.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| CachePadded::new(AtomicU32::new(0))),
        }
    }

    /// Atomically adds one pending item at `priority`.
    ///
    /// Safe under many concurrent submitters.
    #[inline]
    pub fn increment(&self, priority: Priority) {
        self.counts[priority.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically removes one pending item at `priority`.
    ///
    /// Safe under many concurrent workers and interleaved increments.
    ///
    /// # Panics
    ///
    /// Panics (debug) if the count was already zero — a decrement without a
    /// matching increment is a protocol bug in the caller.
    #[inline]
    pub fn decrement(&self, priority: Priority) {
        let prev = self.counts[priority.index()].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "tally underflow at level {priority}");
    }

    /// The smallest level with a nonzero pending count, or `None` when
    /// nothing is pending.
    ///
    /// Scans from most urgent (level 1) to least urgent. Concurrent updates
    /// may or may not be reflected; each per-level read is atomic.
    pub fn highest_pending(&self) -> Option<Priority> {
        for (index, count) in self.counts.iter().enumerate() {
            if count.load(Ordering::Relaxed) > 0 {
                return Some(Priority::from_index(index));
            }
        }
        None
    }

    /// Pending count at one level. Snapshot semantics, as above.
    pub fn pending_at(&self, priority: Priority) -> u32 {
        self.counts[priority.index()].load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Test module includes
// ---------------------------------------------------------------------------

#[cfg(test)]
#[path = "tally_tests.rs"]
mod tally_tests;

// ---------------------------------------------------------------------------
// Loom concurrency tests
// ---------------------------------------------------------------------------

#[cfg(loom)]
mod loom_tests {
    use super::*;
    use loom::thread;
    use std::sync::Arc;

    fn level(n: u8) -> Priority {
        Priority::new(n).unwrap()
    }

    /// Concurrent increments at different levels — both visible, min wins.
    #[test]
    fn concurrent_increments_both_counted() {
        loom::model(|| {
            let tally = Arc::new(UrgencyTally::new());
            let t2 = Arc::clone(&tally);

            let h = thread::spawn(move || t2.increment(level(5)));
            tally.increment(level(2));
            h.join().unwrap();

            assert_eq!(tally.pending_at(level(2)), 1);
            assert_eq!(tally.pending_at(level(5)), 1);
            assert_eq!(tally.highest_pending(), Some(level(2)));
        });
    }

    /// Increment racing a matching decrement never underflows.
    #[test]
    fn increment_decrement_race_non_negative() {
        loom::model(|| {
            let tally = Arc::new(UrgencyTally::new());
            tally.increment(level(3));
            let t2 = Arc::clone(&tally);

            // One pre-existing pending item; one new submission races the
            // worker consuming the old one.
            let h = thread::spawn(move || t2.increment(level(3)));
            tally.decrement(level(3));
            h.join().unwrap();

            assert_eq!(tally.pending_at(level(3)), 1);
            assert_eq!(tally.highest_pending(), Some(level(3)));
        });
    }

    /// Two workers draining two pending items leave the tally empty.
    #[test]
    fn two_workers_drain_to_zero() {
        loom::model(|| {
            let tally = Arc::new(UrgencyTally::new());
            tally.increment(level(1));
            tally.increment(level(1));
            let t2 = Arc::clone(&tally);

            let h = thread::spawn(move || t2.decrement(level(1)));
            tally.decrement(level(1));
            h.join().unwrap();

            assert_eq!(tally.pending_at(level(1)), 0);
            assert_eq!(tally.highest_pending(), None);
        });
    }
}
