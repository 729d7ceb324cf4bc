#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Concurrency and allocation building blocks for a multithreaded network server.
//!
//! This crate provides four primitives that are used together but can each be used alone:
//!
//! - [`ThreadPool`]: a fixed set of worker threads that run submitted closures from a FIFO queue,
//!   returning a [`Handle`] through which callers wait for and retrieve results. Meant for
//!   offloading blocking work such as file or socket I/O from latency-sensitive threads.
//! - [`Event`]: a binary wait/signal primitive with auto-reset and manual-reset modes.
//! - [`SharedMutex`]: a writer-preferring reader-writer lock, also available in raw form as
//!   [`RawSharedMutex`].
//! - [`FastAlloc`]: a lock-free allocator of fixed-size memory blocks for hot paths that would
//!   otherwise hammer the general-purpose allocator with same-sized requests.
//!
//! The pool is built from the other three: its queue lives behind a [`SharedMutex`], its queue
//! nodes come from a [`FastAlloc`] and its workers and blocked producers sleep on [`Event`]s.
//!
//! # Quick start
//!
//! ```rust
//! use std::num::NonZero;
//!
//! use threadwork::{ShutdownMode, ThreadPool};
//!
//! let pool = ThreadPool::new(NonZero::new(2).unwrap()).unwrap();
//!
//! let answer = pool.submit(|| 40 + 2).unwrap();
//! pool.execute(|| println!("fire and forget")).unwrap();
//!
//! assert_eq!(answer.join(), Ok(42));
//!
//! pool.shutdown(ShutdownMode::Graceful);
//! ```
//!
//! # Failures
//!
//! Operations that can fail return [`Result`] with the crate [`Error`]. A task that panics does
//! not take down its worker: the panic is captured and reported through the task's [`Handle`]
//! as a [`TaskError`]. Timed waits report expiry as [`WaitOutcome::TimedOut`], which is an
//! ordinary outcome rather than an error.
//!
//! # Logging
//!
//! The crate emits [`tracing`] events (worker lifecycle and shutdown at `debug`, individual task
//! movements at `trace`, unobserved task panics at `warn`, worker failures at `error`). It never
//! installs a subscriber; that is up to the application.

mod error;
mod event;
mod fast_alloc;
mod handle;
mod pool;
mod queue;
mod shared_mutex;
mod task;
mod worker;

pub use error::*;
pub use event::*;
pub use fast_alloc::*;
pub use handle::*;
pub(crate) use pool::PoolInner;
pub use pool::*;
pub(crate) use queue::*;
pub use shared_mutex::*;
pub use task::TaskState;
pub(crate) use task::{QueuedTask, TaskCell, panic_message};
pub use worker::WorkerStats;
pub(crate) use worker::WorkerState;
