//! Bounded elastic worker pool with strict priority dispatch.
//!
//! ## Scope
//! This crate executes submitted computations in priority order (lowest
//! numeric level first) rather than FIFO, and exposes a live view of the most
//! urgent pending priority. In-process only — no cross-process scheduling, no
//! preemption of running work.
//!
//! ## Key invariants
//! - Dispatch order is strict priority, FIFO among equal levels; a later,
//!   more-urgent submission overtakes queued less-urgent work.
//! - The per-level pending tally is exact bookkeeping: incremented before
//!   enqueue, decremented between dequeue and execution, never negative.
//!   Urgency queries read the tally, never the queue.
//! - Every accepted submission drains, even across shutdown; rejection is
//!   synchronous and explicit.
//! - Task failure is isolated to the task's own completion handle.
//!
//! ## Submission flow
//! `submit -> gate check -> tally.increment -> enqueue -> (worker) dequeue ->
//! tally.decrement -> run -> settle handle -> caller observes via TaskHandle`
//!
//! ## Notable entry points
//! - [`PriorityPool`] / [`PoolConfig`]: the pool itself.
//! - [`TaskHandle`]: wait (optionally bounded), cancel, observe outcome.
//! - [`Priority`] / [`TaskCategory`]: urgency levels and the fixed
//!   category-to-level mapping.
//! - [`UrgencyTally`]: standalone per-level pending counters.
//!
//! ## Design trade-offs
//! Starvation of low-priority work under continuous high-priority submission
//! is accepted behavior. Long-running computations occupy their worker for
//! their full duration; there is no cooperative yielding.

pub mod handle;
pub mod pool;
pub mod priority;
pub mod tally;

mod queue;

pub use handle::{BoxError, TaskError, TaskHandle};
pub use pool::{PoolConfig, PriorityPool, RejectedError};
pub use priority::{InvalidPriority, Priority, TaskCategory, MAX_LEVELS};
pub use tally::UrgencyTally;
