//! Worker thread body and per-worker bookkeeping.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::{PoolInner, panic_message};

/// What a worker thread is doing right now.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WorkerState {
    /// Waiting for work or about to look for it.
    Idle,

    /// Running a task body.
    Busy,

    /// The thread has exited, either at shutdown or because of an internal failure.
    Stopped,
}

/// Snapshot of how many workers of a pool are in each state.
///
/// Returned by [`ThreadPool::worker_stats()`][crate::ThreadPool::worker_stats].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct WorkerStats {
    /// Workers waiting for a task.
    pub idle: usize,

    /// Workers running a task.
    pub busy: usize,

    /// Workers whose threads have exited. Before shutdown, a nonzero value means workers were
    /// lost to internal failures and were not replaced.
    pub stopped: usize,
}

impl WorkerStats {
    pub(crate) fn count(states: &[WorkerState]) -> Self {
        states
            .iter()
            .fold(Self::default(), |mut stats, state| {
                let counter = match state {
                    WorkerState::Idle => &mut stats.idle,
                    WorkerState::Busy => &mut stats.busy,
                    WorkerState::Stopped => &mut stats.stopped,
                };

                *counter = counter.wrapping_add(1);
                stats
            })
    }

    /// Workers that are still alive, whether idle or busy.
    #[must_use]
    pub fn alive(&self) -> usize {
        self.idle.wrapping_add(self.busy)
    }
}

/// Entry point of every worker thread.
///
/// Task panics never get this far, they are captured into the task's handle. A panic that does
/// reach this boundary is a failure of the pool machinery itself: it is logged and the worker
/// stops for good, leaving the rest of the pool running with one worker less.
pub(crate) fn run(pool: Arc<PoolInner>, worker_index: usize) {
    let pool = scopeguard::guard(pool, move |pool| pool.worker_exited(worker_index));

    debug!(worker_index, "worker thread started");

    match panic::catch_unwind(AssertUnwindSafe(|| work_loop(&pool, worker_index))) {
        Ok(()) => debug!(worker_index, "worker thread exiting"),
        Err(payload) => error!(
            worker_index,
            panic_message = %panic_message(&*payload),
            "worker thread failed outside of any task and will not be replaced"
        ),
    }
}

fn work_loop(pool: &PoolInner, worker_index: usize) {
    while let Some(task) = pool.next_task(worker_index) {
        if task.run() {
            trace!(worker_index, "executed task");
        } else {
            trace!(worker_index, "skipped task that was no longer pending");
        }

        pool.task_finished(worker_index);
    }
}
