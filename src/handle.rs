//! Completion handles: the caller-facing side of one submitted computation.
//!
//! A handle pair is created at submission time, before the computation runs,
//! so callers can wait on or cancel an item that has not started yet. The
//! worker resolves the [`Promise`] side exactly once; every clone of the
//! [`TaskHandle`] side observes the same outcome.
//!
//! # Invariants
//! - A handle settles at most once. The first settle wins; a completion
//!   arriving after a cancellation is discarded, and vice versa.
//! - Failure stays on the handle. A failing or panicking computation resolves
//!   its own handle and touches nothing else.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Boxed failure type produced by submitted computations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of one submitted computation, observable many times.
///
/// Cloneable so that every observer of a settled handle can extract it.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The computation returned an error.
    #[error("computation failed: {0}")]
    Failed(Arc<BoxError>),
    /// The computation panicked; the payload is rendered to a message.
    #[error("computation panicked: {0}")]
    Panicked(String),
    /// The handle was cancelled before the computation resolved it.
    #[error("task was cancelled")]
    Cancelled,
    /// A bounded wait elapsed. The computation keeps running regardless.
    #[error("timed out waiting for task completion")]
    WaitTimedOut,
}

enum State<T> {
    Pending,
    Settled(Result<T, TaskError>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,
}

impl<T> Shared<T> {
    /// First settle wins; returns whether this call performed the transition.
    fn settle(&self, outcome: Result<T, TaskError>) -> bool {
        let mut state = self.state.lock().expect("handle mutex poisoned");
        if matches!(*state, State::Settled(_)) {
            return false;
        }
        *state = State::Settled(outcome);
        self.resolved.notify_all();
        true
    }
}

/// Creates a linked promise/handle pair for one submission.
pub(crate) fn handle_pair<T>() -> (Promise<T>, TaskHandle<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending),
        resolved: Condvar::new(),
    });
    (
        Promise {
            shared: Arc::clone(&shared),
        },
        TaskHandle { shared },
    )
}

/// Resolve-exactly-once side, held by the worker via the queued job.
pub(crate) struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Promise<T> {
    /// Settles the handle. Returns `false` if it was already settled
    /// (typically cancelled before the computation started).
    pub(crate) fn settle(&self, outcome: Result<T, TaskError>) -> bool {
        self.shared.settle(outcome)
    }

    /// Whether the handle is already settled. Used by the worker to skip
    /// running a computation whose handle was cancelled while queued.
    pub(crate) fn is_settled(&self) -> bool {
        matches!(
            *self.shared.state.lock().expect("handle mutex poisoned"),
            State::Settled(_)
        )
    }
}

/// Caller-facing completion handle for one submitted computation.
///
/// Available synchronously from `submit`, before execution starts. Cloneable;
/// all clones observe the same outcome.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

// Manual Clone impl to avoid requiring T: Clone
impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Blocks until the computation resolves and returns its outcome.
    ///
    /// Observable many times: repeated calls (and calls on clones) return the
    /// same outcome.
    pub fn wait(&self) -> Result<T, TaskError> {
        let mut state = self.shared.state.lock().expect("handle mutex poisoned");
        loop {
            if let State::Settled(outcome) = &*state {
                return outcome.clone();
            }
            state = self
                .shared
                .resolved
                .wait(state)
                .expect("handle mutex poisoned");
        }
    }

    /// Blocks up to `timeout` for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::WaitTimedOut`] if the bound elapses. Only the
    /// wait is bounded — the computation itself keeps running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().expect("handle mutex poisoned");
        loop {
            if let State::Settled(outcome) = &*state {
                return outcome.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TaskError::WaitTimedOut);
            }
            let (guard, _timed_out) = self
                .shared
                .resolved
                .wait_timeout(state, deadline - now)
                .expect("handle mutex poisoned");
            state = guard;
        }
    }
}

impl<T> TaskHandle<T> {
    /// Attempts to cancel the item.
    ///
    /// Succeeds (returns `true`) only while the handle is unresolved: a queued
    /// item will be skipped by the worker that dequeues it. Cancelling a
    /// running computation does not interrupt it; the handle reports
    /// [`TaskError::Cancelled`] and the eventual result is discarded.
    pub fn cancel(&self) -> bool {
        self.shared.settle(Err(TaskError::Cancelled))
    }

    /// Whether the handle has resolved (value, failure, or cancellation).
    pub fn is_finished(&self) -> bool {
        matches!(
            *self.shared.state.lock().expect("handle mutex poisoned"),
            State::Settled(_)
        )
    }

    /// Whether the handle resolved by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            *self.shared.state.lock().expect("handle mutex poisoned"),
            State::Settled(Err(TaskError::Cancelled))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn settle_then_wait() {
        let (promise, handle) = handle_pair::<u32>();
        assert!(!handle.is_finished());
        assert!(promise.settle(Ok(7)));
        assert_eq!(handle.wait().unwrap(), 7);
        // Observable many times.
        assert_eq!(handle.wait().unwrap(), 7);
        assert_eq!(handle.clone().wait().unwrap(), 7);
    }

    #[test]
    fn wait_blocks_until_settled() {
        let (promise, handle) = handle_pair::<&'static str>();
        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(promise.settle(Ok("done")));
        assert_eq!(waiter.join().unwrap().unwrap(), "done");
    }

    #[test]
    fn wait_timeout_on_pending() {
        let (_promise, handle) = handle_pair::<u32>();
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(10)),
            Err(TaskError::WaitTimedOut)
        ));
        // Timing out does not settle the handle.
        assert!(!handle.is_finished());
    }

    #[test]
    fn cancel_wins_over_later_completion() {
        let (promise, handle) = handle_pair::<u32>();
        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        // Completion after cancellation is discarded.
        assert!(!promise.settle(Ok(1)));
        assert!(matches!(handle.wait(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn cancel_after_completion_fails() {
        let (promise, handle) = handle_pair::<u32>();
        assert!(promise.settle(Ok(3)));
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
        assert_eq!(handle.wait().unwrap(), 3);
    }

    #[test]
    fn failure_is_observable_from_all_clones() {
        let (promise, handle) = handle_pair::<u32>();
        let other = handle.clone();
        let err: BoxError = "backend unavailable".into();
        assert!(promise.settle(Err(TaskError::Failed(Arc::new(err)))));
        assert!(matches!(handle.wait(), Err(TaskError::Failed(_))));
        assert!(matches!(other.wait(), Err(TaskError::Failed(_))));
    }
}
