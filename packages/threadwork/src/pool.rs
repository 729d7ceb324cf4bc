//! Pool management and lifecycle.

use std::any::type_name;
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle as ThreadJoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::{
    DetachedNode, Error, Event, FastAlloc, Handle, QueuedTask, Result, SharedMutex, TaskCell,
    TaskNode, TaskQueue, WaitOutcome, WorkerState, WorkerStats, panic_message,
};

mod builder;

pub use builder::*;

/// What [`ThreadPool::submit()`] does when a bounded queue is full.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum FullQueuePolicy {
    /// The submitting thread blocks until a worker takes a task off the queue. This applies
    /// backpressure to producers that outpace the workers.
    #[default]
    Block,

    /// Submission fails immediately with [`Error::QueueFull`].
    Reject,
}

/// How [`ThreadPool::shutdown()`] treats tasks that have not started yet.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "queued work is either completed or cancelled, there is nothing in between"
)]
pub enum ShutdownMode {
    /// Every task already queued still runs to completion before the workers exit.
    Graceful,

    /// Every task still queued is cancelled without running. Tasks that are already running
    /// are allowed to finish.
    Immediate,
}

/// Queue and worker bookkeeping, only ever touched under the pool lock.
struct PoolState {
    queue: TaskQueue,
    workers: Vec<WorkerState>,
    stopping: bool,
}

impl PoolState {
    fn set_worker(&mut self, worker_index: usize, state: WorkerState) {
        if let Some(slot) = self.workers.get_mut(worker_index) {
            *slot = state;
        }
    }

    fn any_alive(&self) -> bool {
        self.workers
            .iter()
            .any(|state| *state != WorkerState::Stopped)
    }

    /// Nothing is running and nothing that could still run is queued.
    fn is_quiescent(&self) -> bool {
        let any_busy = self.workers.contains(&WorkerState::Busy);

        !any_busy && (self.queue.is_empty() || !self.any_alive())
    }
}

pub(crate) struct PoolInner {
    state: SharedMutex<PoolState>,

    /// Memory for queue nodes. Nodes are allocated before taking the pool lock and freed after
    /// releasing it.
    nodes: FastAlloc,

    /// Auto-reset. Wakes one idle worker; a worker that takes a task and still sees work
    /// queued passes the wake on.
    work_available: Event,

    /// Auto-reset. Wakes one producer blocked on a full queue, who passes the wake on if room
    /// remains after enqueueing.
    space_available: Event,

    /// Manual-reset. Signaled while no task is queued or running.
    quiescent: Event,

    /// Manual-reset. Signaled once shutdown begins; never reset.
    stopping: Event,

    queue_capacity: Option<NonZero<usize>>,
    when_full: FullQueuePolicy,
}

impl PoolInner {
    fn new(
        worker_count: NonZero<usize>,
        queue_capacity: Option<NonZero<usize>>,
        when_full: FullQueuePolicy,
    ) -> Self {
        let quiescent = Event::manual_reset();
        quiescent.signal();

        Self {
            state: SharedMutex::new(PoolState {
                queue: TaskQueue::new(),
                workers: vec![WorkerState::Idle; worker_count.get()],
                stopping: false,
            }),
            nodes: FastAlloc::for_type::<TaskNode>(),
            work_available: Event::auto_reset(),
            space_available: Event::auto_reset(),
            quiescent,
            stopping: Event::manual_reset(),
            queue_capacity,
            when_full,
        }
    }

    fn enqueue(&self, node: DetachedNode) -> Result<()> {
        loop {
            let mut state = self.state.write();

            if state.stopping {
                drop(state);

                // Another producer blocked on space may still be waiting; pass the wake on.
                self.space_available.signal();
                drop(node.into_task(&self.nodes));
                return Err(Error::PoolStopped);
            }

            if let Some(capacity) = self
                .queue_capacity
                .filter(|capacity| state.queue.len() >= capacity.get())
            {
                drop(state);

                match self.when_full {
                    FullQueuePolicy::Reject => {
                        drop(node.into_task(&self.nodes));
                        return Err(Error::QueueFull {
                            capacity: capacity.get(),
                        });
                    }
                    FullQueuePolicy::Block => {
                        trace!(capacity = capacity.get(), "queue full, waiting for space");
                        self.space_available.wait();
                        continue;
                    }
                }
            }

            state.queue.push_back(node);
            self.quiescent.reset();

            let space_left = self
                .queue_capacity
                .is_some_and(|capacity| state.queue.len() < capacity.get());

            drop(state);

            if space_left {
                self.space_available.signal();
            }

            self.work_available.signal();
            return Ok(());
        }
    }

    /// Blocks the calling worker until it can take a task. Returns `None` once the pool is
    /// stopping and the queue is empty.
    pub(crate) fn next_task(&self, worker_index: usize) -> Option<Arc<dyn QueuedTask>> {
        loop {
            let mut state = self.state.write();

            if let Some(node) = state.queue.pop_front() {
                state.set_worker(worker_index, WorkerState::Busy);
                let more_queued = !state.queue.is_empty();
                drop(state);

                if more_queued {
                    self.work_available.signal();
                }

                self.space_available.signal();

                trace!(worker_index, "dequeued task");
                return Some(node.into_task(&self.nodes));
            }

            let stopping = state.stopping;
            drop(state);

            if stopping {
                // Every idle worker must see the shutdown, so pass the wake on.
                self.work_available.signal();
                return None;
            }

            self.work_available.wait();
        }
    }

    pub(crate) fn task_finished(&self, worker_index: usize) {
        let mut state = self.state.write();
        state.set_worker(worker_index, WorkerState::Idle);

        if state.is_quiescent() {
            self.quiescent.signal();
        }
    }

    #[cfg_attr(test, mutants::skip)] // Removing this causes timeouts (drain and shutdown never finish).
    pub(crate) fn worker_exited(&self, worker_index: usize) {
        {
            let mut state = self.state.write();
            state.set_worker(worker_index, WorkerState::Stopped);

            if state.is_quiescent() {
                self.quiescent.signal();
            }
        }

        // If this worker consumed a wake-up it never acted on, hand it to someone else.
        self.work_available.signal();

        // The last worker out cancels whatever it could not drain.
        self.cancel_leftovers();
    }

    fn cancel_queued(&self, task_addr: usize) -> bool {
        let node = {
            let mut state = self.state.write();
            let node = state.queue.remove(task_addr);

            if node.is_some() && state.is_quiescent() {
                self.quiescent.signal();
            }

            node
        };

        let Some(node) = node else {
            return false;
        };

        self.space_available.signal();

        let cancelled = node.into_task(&self.nodes).cancel();
        trace!(cancelled, "removed task from queue");
        cancelled
    }

    /// Marks the pool as stopping and wakes everyone who needs to notice. Returns whether this
    /// call was the one that began the shutdown.
    fn begin_shutdown(&self, mode: ShutdownMode) -> bool {
        let (first, abandoned) = {
            let mut state = self.state.write();

            let first = !state.stopping;
            state.stopping = true;

            let abandoned = match mode {
                ShutdownMode::Graceful => Vec::new(),
                ShutdownMode::Immediate => state.queue.take_all(),
            };

            if state.is_quiescent() {
                self.quiescent.signal();
            }

            (first, abandoned)
        };

        self.stopping.signal();
        self.work_available.signal();
        self.space_available.signal();

        self.cancel_all(abandoned);

        first
    }

    /// Cancels whatever is still queued once the pool is stopping and no worker is left to
    /// drain the queue. While any worker is alive, queued tasks are left for it to run.
    #[cfg_attr(test, mutants::skip)] // Only does work when workers fail, which tests cannot provoke.
    fn cancel_leftovers(&self) {
        let leftovers = {
            let mut state = self.state.write();

            if !state.stopping || state.any_alive() {
                return;
            }

            let leftovers = state.queue.take_all();

            if state.is_quiescent() {
                self.quiescent.signal();
            }

            leftovers
        };

        self.cancel_all(leftovers);
    }

    fn cancel_all(&self, nodes: Vec<DetachedNode>) {
        if nodes.is_empty() {
            return;
        }

        let count = nodes.len();

        for node in nodes {
            node.into_task(&self.nodes).cancel();
        }

        debug!(count, "cancelled queued tasks");
    }
}

impl fmt::Debug for PoolInner {
    #[cfg_attr(test, mutants::skip)] // We have no API contract for this.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("queue_capacity", &self.queue_capacity)
            .field("when_full", &self.when_full)
            .finish_non_exhaustive()
    }
}

/// A fixed-size pool of worker threads that runs submitted closures from a FIFO queue.
///
/// Workers are started when the pool is built and live until it shuts down. Submitting a task
/// returns a [`Handle`] through which the caller can wait for the task and retrieve its result.
/// Tasks submitted from one thread start in submission order; there is no ordering between
/// tasks submitted from different threads.
///
/// Blocking work is what the pool is for: file and socket reads, compression, anything a
/// latency-sensitive thread should not do itself.
///
/// # Failures
///
/// A task that panics is contained: the panic is captured into its handle as
/// [`TaskError::Panicked`][crate::TaskError::Panicked] and the worker moves on to the next task.
///
/// # Lifetime
///
/// When the pool is dropped, it performs a [`ShutdownMode::Immediate`] shutdown: tasks that
/// have not started are cancelled, running tasks complete and the drop blocks until every
/// worker thread has exited. Call [`shutdown()`][Self::shutdown] with
/// [`ShutdownMode::Graceful`] first to have queued tasks run instead.
///
/// # Example
///
/// ```rust
/// use std::num::NonZero;
///
/// use threadwork::{ShutdownMode, ThreadPool};
///
/// let pool = ThreadPool::new(NonZero::new(4).unwrap()).unwrap();
///
/// let handles: Vec<_> = (1..=10_u64)
///     .map(|n| pool.submit(move || n * n).unwrap())
///     .collect();
///
/// let sum: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
/// assert_eq!(sum, 385);
///
/// pool.shutdown(ShutdownMode::Graceful);
/// ```
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    worker_threads: Mutex<Vec<ThreadJoinHandle<()>>>,
    worker_count: NonZero<usize>,
}

impl ThreadPool {
    /// Creates a pool with `worker_count` workers, an unbounded queue and default settings.
    ///
    /// Use [`ThreadPool::builder()`] for more control.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerSpawn`] if a worker thread cannot be started.
    pub fn new(worker_count: NonZero<usize>) -> Result<Self> {
        Self::builder().worker_count(worker_count).build()
    }

    /// Creates a builder for configuring the pool.
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::new()
    }

    fn start(
        worker_count: NonZero<usize>,
        queue_capacity: Option<NonZero<usize>>,
        when_full: FullQueuePolicy,
        thread_name_prefix: &str,
    ) -> Result<Self> {
        let pool = Self {
            inner: Arc::new(PoolInner::new(worker_count, queue_capacity, when_full)),
            worker_threads: Mutex::new(Vec::with_capacity(worker_count.get())),
            worker_count,
        };

        for worker_index in 0..worker_count.get() {
            let inner = Arc::clone(&pool.inner);

            let thread = thread::Builder::new()
                .name(format!("{thread_name_prefix}-w{worker_index}"))
                .spawn(move || crate::worker::run(inner, worker_index))
                // Returning drops the pool, which stops and joins the workers already started.
                .map_err(Error::WorkerSpawn)?;

            pool.worker_threads.lock().push(thread);
        }

        debug!(
            worker_count = worker_count.get(),
            queue_capacity = queue_capacity.map(NonZero::get),
            "thread pool started"
        );

        Ok(pool)
    }

    /// Queues `task` for execution and returns a handle to it without waiting for it to run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolStopped`] once shutdown has begun, [`Error::QueueFull`] if the queue
    /// is bounded and full and the pool was configured with [`FullQueuePolicy::Reject`], and
    /// [`Error::ResourceExhausted`] if memory for the queue entry could not be obtained.
    ///
    /// With [`FullQueuePolicy::Block`], a full queue makes this call block until a worker
    /// takes a task off the queue.
    pub fn submit<F, R>(&self, task: F) -> Result<Handle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let cell = Arc::new(TaskCell::new(task));
        let queued: Arc<dyn QueuedTask> = Arc::<TaskCell<R>>::clone(&cell);

        let node = DetachedNode::new(&self.inner.nodes, queued)?;
        self.inner.enqueue(node)?;

        trace!("task submitted");
        Ok(Handle::new(cell))
    }

    /// Queues `task` for execution without keeping a handle to it.
    ///
    /// If the task panics, the panic is logged as a warning since nobody else will observe it.
    ///
    /// # Errors
    ///
    /// Same as [`submit()`][Self::submit].
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                warn!(
                    panic_message = %panic_message(&*payload),
                    "fire-and-forget task panicked"
                );
            }
        })
        .map(drop)
    }

    /// Withdraws a task that has not started yet.
    ///
    /// Returns `true` if the task was still queued; it will never run and joining its handle
    /// reports [`TaskError::Cancelled`][crate::TaskError::Cancelled]. Returns `false` if the
    /// task is already running or finished, or was submitted to a different pool. Running tasks
    /// are never interrupted.
    pub fn cancel<R>(&self, handle: &Handle<R>) -> bool
    where
        R: Send + 'static,
    {
        let task_addr = Arc::as_ptr(handle.cell()).cast::<()>().addr();
        self.inner.cancel_queued(task_addr)
    }

    /// Stops accepting tasks and waits for every worker thread to exit.
    ///
    /// After this returns, every task submitted to the pool has either finished or been
    /// cancelled, and every further submission fails with [`Error::PoolStopped`]. Calling this
    /// again has no further effect.
    ///
    /// If called from one of the pool's own worker threads, that worker is not waited for.
    /// Once its current task returns it keeps taking tasks off the queue like any other worker
    /// (after a [`ShutdownMode::Graceful`] shutdown there may still be some) and exits when the
    /// queue is empty. If another thread is already waiting for the workers, this call returns
    /// without waiting a second time.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let first = self.inner.begin_shutdown(mode);

        if first {
            debug!(?mode, "thread pool shutting down");
        }

        let threads = mem::take(&mut *self.worker_threads.lock());
        let current = thread::current().id();

        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }

            if thread.join().is_err() {
                // Workers run inside a panic trap, so this means the trap itself failed.
                error!("worker thread terminated by a panic that escaped its panic trap");
            }
        }

        // Only does anything if every worker failed before it could drain the queue.
        self.inner.cancel_leftovers();

        if first {
            debug!("thread pool shut down");
        }
    }

    /// Blocks until the queue is empty and no worker is running a task.
    ///
    /// Tasks submitted concurrently with this call may or may not be waited for. Calling this
    /// from inside a task of the same pool deadlocks, as that task itself keeps the pool busy.
    pub fn drain(&self) {
        self.inner.quiescent.wait();
    }

    /// Like [`drain()`][Self::drain] but gives up after `timeout`.
    #[must_use]
    pub fn drain_timeout(&self, timeout: Duration) -> WaitOutcome {
        self.inner.quiescent.wait_timeout(timeout)
    }

    /// Number of worker threads the pool was built with.
    #[must_use]
    pub fn worker_count(&self) -> NonZero<usize> {
        self.worker_count
    }

    /// Number of tasks waiting in the queue, not counting running tasks.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.inner.state.read().queue.len()
    }

    /// Maximum number of queued tasks, or `None` if the queue is unbounded.
    #[must_use]
    pub fn queue_capacity(&self) -> Option<NonZero<usize>> {
        self.inner.queue_capacity
    }

    /// How many workers are idle, busy or stopped right now.
    #[must_use]
    pub fn worker_stats(&self) -> WorkerStats {
        WorkerStats::count(&self.inner.state.read().workers)
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.is_signaled()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Immediate);
    }
}

impl fmt::Debug for ThreadPool {
    #[cfg_attr(test, mutants::skip)] // We have no API contract for this.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("worker_count", &self.worker_count)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}
