//! Task wrapper that runs a user closure once and records how it ended.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::{Event, TaskError};

/// Where a submitted task is in its lifecycle.
///
/// A task starts out [`Pending`][Self::Pending] in the pool queue. From there it either moves
/// to [`Running`][Self::Running] and then [`Done`][Self::Done], or it is removed from the queue
/// and becomes [`Cancelled`][Self::Cancelled]. Transitions only ever move forward.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "the task lifecycle is fixed and callers should be able to match on all of it"
)]
pub enum TaskState {
    /// Queued and waiting for a worker.
    Pending,

    /// A worker is executing the task body.
    Running,

    /// The task body has finished, either by returning or by panicking.
    Done,

    /// The task was removed from the queue before it started and will never run.
    Cancelled,
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

impl TaskState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            PENDING => Self::Pending,
            RUNNING => Self::Running,
            DONE => Self::Done,
            CANCELLED => Self::Cancelled,
            _ => unreachable!("task state is only ever set from the known constants"),
        }
    }

    /// Whether the task will never change state again.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// The pool-facing side of a task: what a worker runs and what cancellation removes.
pub(crate) trait QueuedTask: Send + Sync {
    /// Runs the task body if the task is still pending. Returns whether the body ran.
    fn run(&self) -> bool;

    /// Moves a pending task to cancelled. Returns `false` if the task had already left the
    /// pending state.
    fn cancel(&self) -> bool;
}

type TaskBody<R> = Box<dyn FnOnce() -> R + Send>;

/// Shared state of one task, referenced by both the pool queue and the caller's handle.
pub(crate) struct TaskCell<R> {
    state: AtomicU8,
    body: Mutex<Option<TaskBody<R>>>,
    outcome: Mutex<Option<Result<R, TaskError>>>,

    /// Signaled once the outcome has been recorded; never reset.
    finished: Event,
}

impl<R> TaskCell<R>
where
    R: Send + 'static,
{
    pub(crate) fn new<F>(body: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
    {
        Self {
            state: AtomicU8::new(PENDING),
            body: Mutex::new(Some(Box::new(body))),
            outcome: Mutex::new(None),
            finished: Event::manual_reset(),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn finished(&self) -> &Event {
        &self.finished
    }

    /// Takes the recorded outcome. Returns `None` if the task has not finished yet or the
    /// outcome was already taken.
    pub(crate) fn take_outcome(&self) -> Option<Result<R, TaskError>> {
        self.outcome.lock().take()
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self, outcome: Result<R, TaskError>, final_state: u8) {
        *self.outcome.lock() = Some(outcome);
        self.state.store(final_state, Ordering::Release);
        self.finished.signal();
    }
}

impl<R> QueuedTask for TaskCell<R>
where
    R: Send + 'static,
{
    fn run(&self) -> bool {
        if !self.transition(PENDING, RUNNING) {
            return false;
        }

        let body = self.body.lock().take();

        let outcome = match body {
            Some(body) => panic::catch_unwind(AssertUnwindSafe(body)).map_err(|payload| {
                let message = panic_message(&*payload);
                debug!(panic_message = %message, "task panicked");
                TaskError::Panicked { message }
            }),
            // Only a pending task has a body and only one caller gets past the transition.
            None => unreachable!("a task that was still pending had no body to run"),
        };

        self.finish(outcome, DONE);
        true
    }

    fn cancel(&self) -> bool {
        if !self.transition(PENDING, CANCELLED) {
            return false;
        }

        // Release whatever the closure captured right away instead of when the handle goes.
        drop(self.body.lock().take());

        self.finish(Err(TaskError::Cancelled), CANCELLED);
        true
    }
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
