use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;
use std::thread;

use crate::{FullQueuePolicy, Result, ThreadPool};

const DEFAULT_THREAD_NAME_PREFIX: &str = "threadwork";

/// Builder for creating an instance of [`ThreadPool`].
///
/// Every setting is optional. By default the pool has one worker per available processor, an
/// unbounded queue and worker threads named `threadwork-w0`, `threadwork-w1` and so on.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use threadwork::{FullQueuePolicy, ThreadPool};
///
/// let pool = ThreadPool::builder()
///     .worker_count(NonZero::new(2).unwrap())
///     .queue_capacity(NonZero::new(64).unwrap())
///     .when_full(FullQueuePolicy::Reject)
///     .thread_name_prefix("io")
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.queue_capacity(), NonZero::new(64));
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct ThreadPoolBuilder {
    worker_count: Option<NonZero<usize>>,
    queue_capacity: Option<NonZero<usize>>,
    when_full: FullQueuePolicy,
    thread_name_prefix: String,

    _not_sync: PhantomData<Cell<()>>,
}

impl ThreadPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            worker_count: None,
            queue_capacity: None,
            when_full: FullQueuePolicy::default(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the number of worker threads.
    ///
    /// Defaults to the number of processors available to the process, as reported by
    /// [`std::thread::available_parallelism()`], or 1 if that cannot be determined.
    pub fn worker_count(mut self, count: NonZero<usize>) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Bounds the queue to at most `capacity` tasks that have not started yet.
    ///
    /// Without a bound, submission never waits and never fails for lack of queue space.
    pub fn queue_capacity(mut self, capacity: NonZero<usize>) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Sets what submission does when a bounded queue is full. Defaults to
    /// [`FullQueuePolicy::Block`].
    ///
    /// Has no effect on an unbounded queue.
    pub fn when_full(mut self, policy: FullQueuePolicy) -> Self {
        self.when_full = policy;
        self
    }

    /// Sets the prefix of worker thread names. Each worker is named `{prefix}-w{index}`.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Starts the worker threads and returns the running pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerSpawn`][crate::Error::WorkerSpawn] if the operating system
    /// refuses to start a worker thread. Any workers that were already started are stopped and
    /// joined before this returns.
    pub fn build(self) -> Result<ThreadPool> {
        let worker_count = self.worker_count.unwrap_or_else(|| {
            thread::available_parallelism().unwrap_or(NonZero::<usize>::MIN)
        });

        ThreadPool::start(
            worker_count,
            self.queue_capacity,
            self.when_full,
            &self.thread_name_prefix,
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use testing::with_watchdog;

    use super::*;

    assert_impl_all!(ThreadPoolBuilder: Send);
    assert_not_impl_any!(ThreadPoolBuilder: Sync);

    #[test]
    #[cfg_attr(miri, ignore)] // Real threads.
    fn defaults_apply() {
        with_watchdog(|| {
            let pool = ThreadPool::builder().build().unwrap();

            let expected = thread::available_parallelism().unwrap_or(NonZero::<usize>::MIN);
            assert_eq!(pool.worker_count(), expected);
            assert_eq!(pool.queue_capacity(), None);
        });
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Real threads.
    fn worker_threads_are_named() {
        with_watchdog(|| {
            let pool = ThreadPool::builder()
                .worker_count(NonZero::new(1).unwrap())
                .thread_name_prefix("named")
                .build()
                .unwrap();

            let seen = Arc::new(Mutex::new(None));

            pool.submit({
                let seen = Arc::clone(&seen);
                move || {
                    *seen.lock() = thread::current().name().map(str::to_string);
                }
            })
            .unwrap()
            .join()
            .unwrap();

            assert_eq!(seen.lock().as_deref(), Some("named-w0"));
        });
    }
}
