use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;
use parking_lot_core::{DEFAULT_PARK_TOKEN, ParkResult, UnparkToken};

/// Set while a writer holds the lock.
const WRITER: usize = 0b001;

/// Set while at least one writer may be waiting for the lock, whether still spinning or
/// already parked. While set, new readers are not admitted.
const WRITERS_WAITING: usize = 0b010;

/// Set while at least one reader may be parked waiting for the writers to go away.
const READERS_PARKED: usize = 0b100;

const FLAGS: usize = WRITER | WRITERS_WAITING | READERS_PARKED;

/// The remaining bits count active readers.
const READER_SHIFT: u32 = 3;
const ONE_READER: usize = 1 << READER_SHIFT;

/// The woken thread must retry acquisition.
const TOKEN_NORMAL: UnparkToken = UnparkToken(0);

/// The woken writer already owns the lock.
const TOKEN_HANDOFF: UnparkToken = UnparkToken(1);

/// A reader-writer lock that protects no data of its own.
///
/// Any number of readers may hold the lock at the same time, or a single writer, never both.
/// Writers are preferred: once a writer is waiting, new readers wait behind it, and a writer
/// that releases the lock hands it straight to the next waiting writer before any waiting
/// reader is let in. This keeps a steady stream of readers from starving writers.
///
/// Contended threads spin briefly and then block in the operating system until woken; no
/// thread ever busy-waits for long.
///
/// Most code wants [`SharedMutex`][crate::SharedMutex], which ties the lock to the data it
/// protects and releases it through guards. This raw form is for callers who need to pair lock
/// and unlock calls across scopes themselves.
///
/// # Example
///
/// ```rust
/// use threadwork::RawSharedMutex;
///
/// let lock = RawSharedMutex::new();
///
/// lock.lock_shared();
/// lock.lock_shared();
/// assert_eq!(lock.reader_count(), 2);
/// assert!(!lock.try_lock());
///
/// // SAFETY: We hold two shared locks and release both.
/// unsafe {
///     lock.unlock_shared();
///     lock.unlock_shared();
/// }
///
/// assert!(lock.try_lock());
///
/// // SAFETY: We hold the exclusive lock.
/// unsafe { lock.unlock() };
/// ```
#[derive(Debug, Default)]
pub struct RawSharedMutex {
    state: AtomicUsize,
}

impl RawSharedMutex {
    /// Creates an unlocked lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Acquires the lock exclusively, blocking until no other holder remains.
    ///
    /// The lock is not reentrant: calling this while the current thread already holds the lock
    /// in either mode deadlocks.
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }
    }

    /// Attempts to acquire the lock exclusively without blocking.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);

        loop {
            if !is_free(state) {
                return false;
            }

            match self.state.compare_exchange_weak(
                state,
                state | WRITER,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Releases an exclusive lock.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock exclusively, acquired through [`lock()`][Self::lock] or a
    /// successful [`try_lock()`][Self::try_lock].
    pub unsafe fn unlock(&self) {
        debug_assert!(
            self.is_locked_exclusive(),
            "unlock() called without holding the exclusive lock"
        );

        if self
            .state
            .compare_exchange(WRITER, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            self.unlock_slow();
        }
    }

    /// Acquires the lock in shared mode, blocking while a writer holds or waits for it.
    ///
    /// Shared acquisition is not reentrant either: a thread that already holds a shared lock
    /// and asks for another may deadlock if a writer arrives in between.
    pub fn lock_shared(&self) {
        if !self.try_lock_shared() {
            self.lock_shared_slow();
        }
    }

    /// Attempts to acquire the lock in shared mode without blocking.
    ///
    /// Fails if a writer holds the lock or is waiting for it.
    #[must_use]
    pub fn try_lock_shared(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);

        loop {
            if !admits_readers(state) {
                return false;
            }

            match self.state.compare_exchange_weak(
                state,
                add_reader(state),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    /// Releases a shared lock.
    ///
    /// # Safety
    ///
    /// The caller must hold a shared lock, acquired through
    /// [`lock_shared()`][Self::lock_shared] or a successful
    /// [`try_lock_shared()`][Self::try_lock_shared], and release it only once.
    pub unsafe fn unlock_shared(&self) {
        let previous = self.state.fetch_sub(ONE_READER, Ordering::Release);

        debug_assert!(
            previous >= ONE_READER,
            "unlock_shared() called without holding a shared lock"
        );

        let was_last_reader = previous & !FLAGS == ONE_READER;

        if was_last_reader && previous & WRITERS_WAITING != 0 {
            self.unpark_writer();
        }
    }

    /// Whether the lock is held in any mode.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !is_free(self.state.load(Ordering::Relaxed))
    }

    /// Whether a writer holds the lock.
    #[must_use]
    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    /// Number of readers currently holding the lock.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.load(Ordering::Relaxed) >> READER_SHIFT
    }

    /// Whether any writer may be waiting for the lock, either spinning briefly or blocked.
    ///
    /// While this is `true`, no new reader is admitted. May briefly report `true` after the last
    /// waiting writer has already acquired the lock.
    #[must_use]
    pub fn has_waiting_writers(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITERS_WAITING != 0
    }

    #[cold]
    fn lock_slow(&self) {
        let backoff = Backoff::new();
        let mut state = self.state.load(Ordering::Relaxed);

        loop {
            // Writers may barge past waiting writers; only readers are held back by the flag.
            if is_free(state) {
                match self.state.compare_exchange_weak(
                    state,
                    state | WRITER,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }

            // Announced before spinning, so that no new reader gets in while we spin.
            if state & WRITERS_WAITING == 0 {
                if let Err(actual) = self.state.compare_exchange_weak(
                    state,
                    state | WRITERS_WAITING,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    state = actual;
                    continue;
                }
            }

            if !backoff.is_completed() {
                backoff.snooze();
                state = self.state.load(Ordering::Relaxed);
                continue;
            }

            let validate = || {
                let state = self.state.load(Ordering::Relaxed);
                state & WRITERS_WAITING != 0 && !is_free(state)
            };

            // SAFETY: The key is derived from our own address, which stays valid while we are
            // parked because we are borrowed. The closures neither panic nor re-enter the
            // parking lot.
            let result = unsafe {
                parking_lot_core::park(
                    self.writer_key(),
                    validate,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                )
            };

            if matches!(result, ParkResult::Unparked(TOKEN_HANDOFF)) {
                return;
            }

            backoff.reset();
            state = self.state.load(Ordering::Relaxed);
        }
    }

    #[cold]
    fn unlock_slow(&self) {
        let mut state = self.state.load(Ordering::Relaxed);

        let previous = loop {
            let mut new_state = state & !WRITER;

            // Parked readers stay parked if a writer is waiting; that writer goes first.
            if state & WRITERS_WAITING == 0 {
                new_state &= !READERS_PARKED;
            }

            match self.state.compare_exchange_weak(
                state,
                new_state,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(previous) => break previous,
                Err(actual) => state = actual,
            }
        };

        if previous & WRITERS_WAITING != 0 {
            self.unpark_writer();
        } else if previous & READERS_PARKED != 0 {
            self.unpark_readers();
        }
    }

    #[cold]
    fn lock_shared_slow(&self) {
        let backoff = Backoff::new();
        let mut state = self.state.load(Ordering::Relaxed);

        loop {
            if admits_readers(state) {
                match self.state.compare_exchange_weak(
                    state,
                    add_reader(state),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(actual) => {
                        state = actual;
                        continue;
                    }
                }
            }

            if state & READERS_PARKED == 0 {
                if !backoff.is_completed() {
                    backoff.snooze();
                    state = self.state.load(Ordering::Relaxed);
                    continue;
                }

                if let Err(actual) = self.state.compare_exchange_weak(
                    state,
                    state | READERS_PARKED,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    state = actual;
                    continue;
                }
            }

            let validate = || {
                let state = self.state.load(Ordering::Relaxed);
                state & READERS_PARKED != 0 && !admits_readers(state)
            };

            // SAFETY: As in lock_slow().
            unsafe {
                parking_lot_core::park(
                    self.reader_key(),
                    validate,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                );
            }

            // Readers are never handed the lock, they always compete for it again.
            backoff.reset();
            state = self.state.load(Ordering::Relaxed);
        }
    }

    /// Wakes one parked writer. If the lock is free at that moment, ownership passes to the
    /// woken writer directly so that no reader or barging writer can slip in between.
    fn unpark_writer(&self) {
        // SAFETY: The key is derived from our own address. The callback runs under the parking
        // lot bucket lock and neither panics nor re-enters the parking lot.
        let result = unsafe {
            parking_lot_core::unpark_one(self.writer_key(), |result| {
                if result.unparked_threads == 0 {
                    self.state.fetch_and(!WRITERS_WAITING, Ordering::Relaxed);
                    return TOKEN_NORMAL;
                }

                let mut state = self.state.load(Ordering::Relaxed);

                loop {
                    if !is_free(state) {
                        return TOKEN_NORMAL;
                    }

                    let mut new_state = state | WRITER;

                    if !result.have_more_threads {
                        new_state &= !WRITERS_WAITING;
                    }

                    match self.state.compare_exchange_weak(
                        state,
                        new_state,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return TOKEN_HANDOFF,
                        Err(actual) => state = actual,
                    }
                }
            })
        };

        // Nobody was parked after all, so nothing stands between parked readers and the lock
        // unless a writer arrived in the meantime.
        if result.unparked_threads == 0 {
            self.release_parked_readers();
        }
    }

    fn release_parked_readers(&self) {
        let mut state = self.state.load(Ordering::Relaxed);

        loop {
            // Whoever holds or waits for the lock as a writer wakes the readers later.
            if state & READERS_PARKED == 0 || state & (WRITER | WRITERS_WAITING) != 0 {
                return;
            }

            match self.state.compare_exchange_weak(
                state,
                state & !READERS_PARKED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }

        self.unpark_readers();
    }

    fn unpark_readers(&self) {
        // SAFETY: The key is derived from our own address.
        unsafe {
            parking_lot_core::unpark_all(self.reader_key(), TOKEN_NORMAL);
        }
    }

    fn reader_key(&self) -> usize {
        self.state.as_ptr().addr()
    }

    fn writer_key(&self) -> usize {
        // Any address inside the atomic is ours to use as a key and cannot collide with the
        // keys of another lock.
        self.reader_key().wrapping_add(1)
    }
}

/// No writer holds the lock and no reader does either.
fn is_free(state: usize) -> bool {
    state & WRITER == 0 && state < ONE_READER
}

fn admits_readers(state: usize) -> bool {
    state & (WRITER | WRITERS_WAITING) == 0
}

fn add_reader(state: usize) -> usize {
    let Some(new_state) = state.checked_add(ONE_READER) else {
        panic!("too many concurrent readers on a RawSharedMutex");
    };

    new_state
}
