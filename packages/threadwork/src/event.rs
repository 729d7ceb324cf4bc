//! Cross-thread wait/signal event with auto-reset and manual-reset modes.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN, ParkResult};

const CLEAR: u8 = 0;
const SIGNALED: u8 = 1;

/// How an [`Event`] returns to the clear state after being signaled.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "an event is either auto-reset or manual-reset, there is no third kind"
)]
pub enum ResetMode {
    /// Each signal releases exactly one waiter. If nobody is waiting, the signal is remembered
    /// (but not counted) until the next wait consumes it.
    Auto,

    /// A signal releases every current and future waiter until the event is explicitly
    /// [reset][Event::reset].
    Manual,
}

/// Result of a bounded wait.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "a bounded wait either observes the signal or runs out of time"
)]
pub enum WaitOutcome {
    /// The wait ended because the awaited condition was signaled.
    Signaled,

    /// The deadline passed first. This is a normal outcome, not an error.
    TimedOut,
}

impl WaitOutcome {
    /// Whether the wait ended because of a signal.
    #[must_use]
    pub fn is_signaled(self) -> bool {
        matches!(self, Self::Signaled)
    }
}

/// A binary event that threads can block on until another thread signals it.
///
/// The event is either clear or signaled. Waiting on a signaled event returns immediately;
/// waiting on a clear event blocks the calling thread until the event is signaled or the wait
/// times out. What happens to the signal afterwards depends on the [`ResetMode`] chosen at
/// construction.
///
/// The state check of a wait and the state change of a signal are serialized by the same
/// internal lock as the decision to block or to wake, so a signal that races with a thread that
/// is about to block is never lost.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::thread;
///
/// use threadwork::Event;
///
/// let ready = Arc::new(Event::manual_reset());
///
/// let waiter = thread::spawn({
///     let ready = Arc::clone(&ready);
///     move || ready.wait()
/// });
///
/// ready.signal();
/// waiter.join().unwrap();
///
/// // A manual-reset event stays signaled until reset.
/// assert!(ready.try_wait());
/// ready.reset();
/// assert!(!ready.try_wait());
/// ```
#[derive(Debug)]
pub struct Event {
    /// Also serves as the parking key, so the event must not move while anyone waits on it,
    /// which borrowing already guarantees.
    state: AtomicU8,
    waiters: AtomicUsize,
    mode: ResetMode,
}

impl Event {
    /// Creates a clear event with the given reset mode.
    #[must_use]
    pub const fn new(mode: ResetMode) -> Self {
        Self {
            state: AtomicU8::new(CLEAR),
            waiters: AtomicUsize::new(0),
            mode,
        }
    }

    /// Creates a clear auto-reset event.
    #[must_use]
    pub const fn auto_reset() -> Self {
        Self::new(ResetMode::Auto)
    }

    /// Creates a clear manual-reset event.
    #[must_use]
    pub const fn manual_reset() -> Self {
        Self::new(ResetMode::Manual)
    }

    /// The reset mode fixed at construction.
    #[must_use]
    pub fn mode(&self) -> ResetMode {
        self.mode
    }

    /// Signals the event.
    ///
    /// For a manual-reset event, every waiting thread is released and the event stays signaled
    /// until [`reset()`][Self::reset]. For an auto-reset event, exactly one waiting thread is
    /// released; if no thread is waiting, the event stays signaled until one wait consumes it.
    /// Signaling an already signaled event has no further effect.
    pub fn signal(&self) {
        match self.mode {
            ResetMode::Manual => {
                self.state.store(SIGNALED, Ordering::Release);

                // SAFETY: The key is the address of our own state and stays valid while any
                // thread is parked on it, because parked threads borrow the event.
                unsafe {
                    parking_lot_core::unpark_all(self.key(), DEFAULT_UNPARK_TOKEN);
                }
            }
            ResetMode::Auto => {
                // SAFETY: As above. The callback runs under the parking lot bucket lock, the
                // same lock under which waiters validate before parking.
                unsafe {
                    parking_lot_core::unpark_one(self.key(), |result| {
                        // A released waiter takes the signal with it; otherwise it is stored.
                        if result.unparked_threads == 0 {
                            self.state.store(SIGNALED, Ordering::Release);
                        }

                        DEFAULT_UNPARK_TOKEN
                    });
                }
            }
        }
    }

    /// Returns a manual-reset event to the clear state.
    ///
    /// # Panics
    ///
    /// Panics if the event is auto-reset, which clears itself.
    pub fn reset(&self) {
        assert!(
            self.mode == ResetMode::Manual,
            "reset() is only valid on a manual-reset event"
        );

        self.state.store(CLEAR, Ordering::Release);
    }

    /// Checks the event without blocking.
    ///
    /// Returns `true` if the event was signaled. For an auto-reset event, this consumes the
    /// signal exactly like a completed wait would.
    #[must_use]
    pub fn try_wait(&self) -> bool {
        match self.mode {
            ResetMode::Manual => self.state.load(Ordering::Acquire) == SIGNALED,
            ResetMode::Auto => self
                .state
                .compare_exchange(SIGNALED, CLEAR, Ordering::Acquire, Ordering::Relaxed)
                .is_ok(),
        }
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let outcome = self.wait_until(None);
        debug_assert_eq!(outcome, WaitOutcome::Signaled);
    }

    /// Blocks until the event is signaled or `timeout` elapses.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        // A timeout too large to represent is as good as no timeout at all.
        self.wait_until(Instant::now().checked_add(timeout))
    }

    /// Blocks until the event is signaled or `deadline` passes.
    #[must_use]
    pub fn wait_deadline(&self, deadline: Instant) -> WaitOutcome {
        self.wait_until(Some(deadline))
    }

    /// Whether the event is currently signaled. Does not consume an auto-reset signal.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALED
    }

    /// Number of threads currently inside a blocking wait on this event.
    ///
    /// Intended for diagnostics and tests; the value may be stale as soon as it is returned.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    fn wait_until(&self, deadline: Option<Instant>) -> WaitOutcome {
        if self.try_wait() {
            return WaitOutcome::Signaled;
        }

        self.waiters.fetch_add(1, Ordering::Relaxed);

        // Runs under the bucket lock. Returning false means "do not park": the signal is
        // already there (and, for auto-reset, has just been consumed by us).
        let validate = || !self.try_wait();

        // SAFETY: The key is the address of our own state, valid for the duration of the call.
        // The closures do not panic and do not call into the parking lot.
        let result = unsafe {
            parking_lot_core::park(
                self.key(),
                validate,
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                deadline,
            )
        };

        self.waiters.fetch_sub(1, Ordering::Relaxed);

        match result {
            ParkResult::Unparked(_) | ParkResult::Invalid => WaitOutcome::Signaled,
            ParkResult::TimedOut => WaitOutcome::TimedOut,
        }
    }

    fn key(&self) -> usize {
        self.state.as_ptr().addr()
    }
}
