use std::io;

use thiserror::Error;

/// Errors that can occur when allocating blocks or submitting work to a pool.
///
/// Failures raised by a task body are never reported through this type. They are captured into
/// the task's [`Handle`][crate::Handle] as a [`TaskError`] instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A [`FastAlloc`][crate::FastAlloc] needed a new chunk but could not obtain one, either
    /// because the system allocator refused the request or because the allocator reached the
    /// chunk limit it was explicitly configured with.
    #[error("unable to grow the block allocator by a chunk of {chunk_bytes} bytes")]
    ResourceExhausted {
        /// Size of the chunk allocation that was attempted.
        chunk_bytes: usize,
    },

    /// The pool has begun shutting down and no longer accepts work.
    #[error("the thread pool is stopped and no longer accepts tasks")]
    PoolStopped,

    /// The pool queue is at capacity and the pool was configured to reject instead of wait.
    #[error("the task queue is full (capacity {capacity})")]
    QueueFull {
        /// The configured capacity of the queue.
        capacity: usize,
    },

    /// The operating system refused to start a worker thread.
    #[error("failed to spawn a worker thread")]
    WorkerSpawn(#[source] io::Error),
}

/// A specialized `Result` type for threadwork operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a task did not produce a value.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum TaskError {
    /// The task body panicked. The panic was contained to the task and the worker thread that
    /// ran it moved on to its next task.
    #[error("task panicked: {message}")]
    Panicked {
        /// The panic message, if the payload was a string; a placeholder otherwise.
        message: String,
    },

    /// The task was removed from the queue before it started, either by an explicit
    /// [`ThreadPool::cancel()`][crate::ThreadPool::cancel] or by an immediate shutdown.
    #[error("task was cancelled before it started")]
    Cancelled,
}
