#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and examples in threadwork packages.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on how long [`spin_until()`] waits for its condition before giving up.
const SPIN_LIMIT: Duration = Duration::from_secs(5);

/// Runs a test with a timeout to prevent infinite hangs.
///
/// Threading primitives fail by hanging more often than by returning a wrong answer, so every
/// test that blocks on another thread goes through this. If the test takes longer than the
/// timeout, the calling thread panics and the test fails instead of stalling the whole run.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under Miri, where thread
/// synchronization is significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test function is executed directly, so that mutation testing can observe mutations that
/// turn into hangs.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode), and propagates
/// any panic raised by the test itself.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out and nobody is listening.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded its {timeout:?} watchdog timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected unexpectedly"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Yields the current thread until `condition` returns `true`.
///
/// Used to wait for another thread to reach a state that has no blocking wait of its own,
/// such as "a thread is now parked on this event".
///
/// # Panics
///
/// Panics if the condition is still false after a few seconds. Under a watchdog this turns a
/// hang into a readable failure.
#[cfg_attr(test, mutants::skip)] // Mutations only turn into hangs or spurious failures.
pub fn spin_until(mut condition: impl FnMut() -> bool) {
    let started = Instant::now();

    while !condition() {
        assert!(
            started.elapsed() < SPIN_LIMIT,
            "condition did not become true within {SPIN_LIMIT:?}"
        );

        thread::yield_now();
    }
}
