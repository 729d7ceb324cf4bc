//! Integration tests for the reader-writer lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use testing::{spin_until, with_watchdog};
use threadwork::SharedMutex;

#[cfg_attr(miri, ignore)]
#[test]
fn waiting_writer_goes_before_later_reader() {
    with_watchdog(|| {
        let lock = Arc::new(SharedMutex::new(0_u32));
        let log = Arc::new(Mutex::new(Vec::new()));

        let early_reader = lock.read();

        let writer = thread::spawn({
            let lock = Arc::clone(&lock);
            let log = Arc::clone(&log);
            move || {
                let mut value = lock.write();
                *value = 1;
                log.lock().push("writer");
            }
        });

        spin_until(|| lock.raw().has_waiting_writers());

        let late_reader = thread::spawn({
            let lock = Arc::clone(&lock);
            let log = Arc::clone(&log);
            move || {
                let value = lock.read();
                log.lock().push("late reader");
                *value
            }
        });

        // Give the late reader every chance to (wrongly) get in next to the early reader.
        thread::sleep(Duration::from_millis(50));
        assert!(log.lock().is_empty());
        assert_eq!(lock.raw().reader_count(), 1);

        drop(early_reader);

        writer.join().unwrap();
        let observed = late_reader.join().unwrap();

        assert_eq!(*log.lock(), vec!["writer", "late reader"]);
        assert_eq!(observed, 1);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn unlocking_writer_hands_over_to_waiting_writer_first() {
    with_watchdog(|| {
        let lock = Arc::new(SharedMutex::new(Vec::new()));

        let first_writer = lock.write();

        let second_writer = thread::spawn({
            let lock = Arc::clone(&lock);
            move || lock.write().push("writer")
        });

        spin_until(|| lock.raw().has_waiting_writers());

        let reader = thread::spawn({
            let lock = Arc::clone(&lock);
            move || lock.read().clone()
        });

        thread::sleep(Duration::from_millis(20));
        drop(first_writer);

        second_writer.join().unwrap();

        // The reader was waiting all along but still sees the second writer's change.
        assert_eq!(reader.join().unwrap(), vec!["writer"]);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn readers_hold_the_lock_concurrently() {
    with_watchdog(|| {
        const READERS: usize = 4;

        let lock = Arc::new(SharedMutex::new(()));
        let inside = Arc::new(AtomicUsize::new(0));

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    let _guard = lock.read();
                    inside.fetch_add(1, Ordering::SeqCst);

                    // Everyone must be inside at the same time for this to finish.
                    spin_until(|| inside.load(Ordering::SeqCst) == READERS);
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }

        assert!(!lock.raw().is_locked());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn writers_never_overlap_with_anyone() {
    with_watchdog(|| {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 1_000;

        let lock = Arc::new(SharedMutex::new((0_usize, 0_usize)));
        let writers_inside = Arc::new(AtomicUsize::new(0));
        let readers_inside = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..THREADS)
            .map(|thread_index| {
                let lock = Arc::clone(&lock);
                let writers_inside = Arc::clone(&writers_inside);
                let readers_inside = Arc::clone(&readers_inside);

                thread::spawn(move || {
                    for iteration in 0..ITERATIONS {
                        if (thread_index + iteration) % 3 == 0 {
                            let mut pair = lock.write();
                            assert_eq!(writers_inside.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(readers_inside.load(Ordering::SeqCst), 0);

                            pair.0 += 1;
                            pair.1 += 1;

                            writers_inside.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            let pair = lock.read();
                            readers_inside.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(writers_inside.load(Ordering::SeqCst), 0);

                            // A torn update would show up as a mismatch.
                            assert_eq!(pair.0, pair.1);

                            readers_inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        let (first, second) = *lock.read();
        assert_eq!(first, second);
        assert!(first > 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn guard_released_when_holder_panics() {
    with_watchdog(|| {
        let lock = Arc::new(SharedMutex::new(5));

        let result = thread::spawn({
            let lock = Arc::clone(&lock);
            move || {
                let _guard = lock.write();
                panic!("holder failed");
            }
        })
        .join();

        assert!(result.is_err());
        assert!(!lock.raw().is_locked());
        assert_eq!(*lock.read(), 5);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn announced_writer_turns_away_readers_before_it_blocks() {
    with_watchdog(|| {
        const ROUNDS: usize = 200;

        for _ in 0..ROUNDS {
            let lock = Arc::new(SharedMutex::new(0_u32));
            let early_reader = lock.read();

            let writer = thread::spawn({
                let lock = Arc::clone(&lock);
                move || *lock.write() += 1
            });

            // The writer announces itself as soon as it starts contending, while it may still
            // be spinning rather than blocked.
            spin_until(|| lock.raw().has_waiting_writers());
            assert!(lock.try_read().is_none());

            drop(early_reader);
            writer.join().unwrap();

            assert_eq!(*lock.read(), 1);
        }
    });
}
