//! Handle for observing and joining a submitted task.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{TaskCell, TaskError, TaskState, WaitOutcome};

/// A handle to a task submitted to a [`ThreadPool`][crate::ThreadPool].
///
/// The handle observes the task's state, blocks until it finishes and retrieves its outcome.
/// Joining consumes the handle, so the outcome is delivered exactly once.
///
/// Dropping the handle does not cancel the task; the task still runs and its outcome is
/// discarded. Use [`ThreadPool::cancel()`][crate::ThreadPool::cancel] to withdraw a task that
/// has not started yet.
///
/// # Example
///
/// ```rust
/// use std::num::NonZero;
///
/// use threadwork::{TaskState, ThreadPool};
///
/// let pool = ThreadPool::new(NonZero::new(2).unwrap()).unwrap();
///
/// let handle = pool.submit(|| 6 * 7).unwrap();
///
/// handle.wait();
/// assert_eq!(handle.state(), TaskState::Done);
/// assert_eq!(handle.join(), Ok(42));
/// ```
pub struct Handle<R> {
    cell: Arc<TaskCell<R>>,
}

impl<R> Handle<R>
where
    R: Send + 'static,
{
    pub(crate) fn new(cell: Arc<TaskCell<R>>) -> Self {
        Self { cell }
    }

    pub(crate) fn cell(&self) -> &Arc<TaskCell<R>> {
        &self.cell
    }

    /// The current lifecycle state of the task.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    /// Whether the task has reached a final state, either by running to completion (including
    /// by panicking) or by being cancelled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cell.finished().is_signaled()
    }

    /// Blocks the calling thread until the task is finished.
    ///
    /// Calling this from inside a task on a pool whose workers are all busy waiting for each
    /// other deadlocks, as with any blocking join.
    pub fn wait(&self) {
        self.cell.finished().wait();
    }

    /// Blocks until the task is finished or `timeout` elapses, whichever comes first.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        self.cell.finished().wait_timeout(timeout)
    }

    /// Blocks until the task is finished and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Panicked`] if the task body panicked and [`TaskError::Cancelled`]
    /// if the task was cancelled before it started.
    pub fn join(self) -> Result<R, TaskError> {
        self.wait();
        self.take_finished_outcome()
    }

    /// Returns the outcome if the task has already finished, or gives the handle back if not.
    ///
    /// # Errors
    ///
    /// Returns the handle itself as the error if the task is not finished yet.
    pub fn try_join(self) -> Result<Result<R, TaskError>, Self> {
        if self.is_finished() {
            Ok(self.take_finished_outcome())
        } else {
            Err(self)
        }
    }

    fn take_finished_outcome(&self) -> Result<R, TaskError> {
        // The finished event is only signaled after the outcome is stored, and only this
        // handle ever takes it.
        self.cell
            .take_outcome()
            .expect("a finished task always has an outcome for its only handle")
    }
}

impl<R> fmt::Debug for Handle<R>
where
    R: Send + 'static,
{
    #[cfg_attr(test, mutants::skip)] // We have no API contract for this.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
