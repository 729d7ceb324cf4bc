//! Integration tests for the thread pool.
//!
//! These tests verify full pool behavior with real threads. They are ignored under Miri because
//! they spawn many threads and measure real time.

use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use testing::{spin_until, with_watchdog};
use threadwork::{
    Error, Event, FullQueuePolicy, ShutdownMode, TaskError, TaskState, ThreadPool, WaitOutcome,
};

fn nz(value: usize) -> NonZero<usize> {
    NonZero::new(value).unwrap()
}

/// Occupies the only worker of `pool` until the returned gate is signaled. Returns once the
/// blocking task is running, so that anything submitted afterwards stays queued.
fn occupy_worker(pool: &ThreadPool) -> (Arc<Event>, threadwork::Handle<()>) {
    let gate = Arc::new(Event::manual_reset());
    let started = Arc::new(Event::manual_reset());

    let handle = pool
        .submit({
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            move || {
                started.signal();
                gate.wait();
            }
        })
        .unwrap();

    started.wait();
    (gate, handle)
}

#[cfg_attr(miri, ignore)]
#[test]
fn two_workers_run_five_sleeping_tasks_in_three_rounds() {
    with_watchdog(|| {
        let pool = ThreadPool::new(nz(2)).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));

        let started = Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let running = Arc::clone(&running);
                let max_running = Arc::clone(&max_running);
                pool.submit(move || {
                    let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_running.fetch_max(now_running, Ordering::SeqCst);

                    thread::sleep(Duration::from_millis(10));

                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let elapsed = started.elapsed();

        // Five tasks on two workers need at least three rounds of 10 ms each, while running
        // them one at a time would take 50 ms.
        assert!(elapsed >= Duration::from_millis(30), "took only {elapsed:?}");
        assert!(
            elapsed < Duration::from_millis(50),
            "took {elapsed:?}, as long as running the tasks one at a time"
        );
        assert_eq!(max_running.load(Ordering::SeqCst), 2);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn many_tasks_from_many_producers_each_run_once() {
    with_watchdog(|| {
        const PRODUCERS: usize = 4;
        const TASKS_PER_PRODUCER: usize = 250;

        let pool = Arc::new(ThreadPool::new(nz(3)).unwrap());
        let completed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let completed = Arc::clone(&completed);
                thread::spawn(move || {
                    let handles: Vec<_> = (0..TASKS_PER_PRODUCER)
                        .map(|_| {
                            let completed = Arc::clone(&completed);
                            pool.submit(move || completed.fetch_add(1, Ordering::SeqCst))
                                .unwrap()
                        })
                        .collect();

                    for handle in handles {
                        handle.join().unwrap();
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(completed.load(Ordering::SeqCst), PRODUCERS * TASKS_PER_PRODUCER);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn tasks_from_one_producer_start_in_submission_order() {
    with_watchdog(|| {
        let pool = ThreadPool::new(nz(1)).unwrap();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..20)
            .map(|index| {
                let order = Arc::clone(&order);
                pool.submit(move || order.lock().push(index)).unwrap()
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn bounded_queue_blocks_producer_until_space() {
    with_watchdog(|| {
        let pool = Arc::new(
            ThreadPool::builder()
                .worker_count(nz(1))
                .queue_capacity(nz(1))
                .when_full(FullQueuePolicy::Block)
                .build()
                .unwrap(),
        );

        let (gate, first) = occupy_worker(&pool);

        let second = pool.submit(|| 2).unwrap();
        assert_eq!(pool.queue_depth(), 1);

        let third_submitted = Arc::new(AtomicBool::new(false));

        let producer = thread::spawn({
            let pool = Arc::clone(&pool);
            let third_submitted = Arc::clone(&third_submitted);
            move || {
                let third = pool.submit(|| 3).unwrap();
                third_submitted.store(true, Ordering::SeqCst);
                third.join()
            }
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!third_submitted.load(Ordering::SeqCst));

        gate.signal();

        assert_eq!(first.join(), Ok(()));
        assert_eq!(second.join(), Ok(2));
        assert_eq!(producer.join().unwrap(), Ok(3));
        assert!(third_submitted.load(Ordering::SeqCst));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn bounded_queue_rejects_when_configured() {
    with_watchdog(|| {
        let pool = ThreadPool::builder()
            .worker_count(nz(1))
            .queue_capacity(nz(1))
            .when_full(FullQueuePolicy::Reject)
            .build()
            .unwrap();

        let (gate, _first) = occupy_worker(&pool);

        let second = pool.submit(|| ()).unwrap();
        let third = pool.submit(|| ());

        assert!(matches!(third, Err(Error::QueueFull { capacity: 1 })));
        assert_eq!(pool.queue_depth(), 1);

        gate.signal();
        second.join().unwrap();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn many_blocked_producers_all_get_through() {
    with_watchdog(|| {
        const PRODUCERS: usize = 4;
        const TASKS_PER_PRODUCER: usize = 100;

        let pool = Arc::new(
            ThreadPool::builder()
                .worker_count(nz(2))
                .queue_capacity(nz(2))
                .build()
                .unwrap(),
        );
        let completed = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let completed = Arc::clone(&completed);
                thread::spawn(move || {
                    for _ in 0..TASKS_PER_PRODUCER {
                        let completed = Arc::clone(&completed);
                        pool.execute(move || {
                            completed.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        pool.drain();
        assert_eq!(completed.load(Ordering::SeqCst), PRODUCERS * TASKS_PER_PRODUCER);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn graceful_shutdown_runs_queued_tasks_and_rejects_new_ones() {
    with_watchdog(|| {
        let pool = Arc::new(ThreadPool::new(nz(1)).unwrap());
        let ran = Arc::new(AtomicUsize::new(0));

        let (gate, _first) = occupy_worker(&pool);

        let queued: Vec<_> = (0..3)
            .map(|_| {
                let ran = Arc::clone(&ran);
                pool.submit(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        let stopper = thread::spawn({
            let pool = Arc::clone(&pool);
            move || pool.shutdown(ShutdownMode::Graceful)
        });

        spin_until(|| pool.is_stopping());
        assert!(matches!(pool.submit(|| ()), Err(Error::PoolStopped)));

        gate.signal();
        stopper.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        for handle in queued {
            assert_eq!(handle.state(), TaskState::Done);
            assert_eq!(handle.join(), Ok(()));
        }

        assert_eq!(pool.worker_stats().stopped, 1);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn immediate_shutdown_cancels_queued_tasks_without_running_them() {
    with_watchdog(|| {
        let pool = Arc::new(ThreadPool::new(nz(1)).unwrap());
        let ran = Arc::new(AtomicUsize::new(0));

        let (gate, running) = occupy_worker(&pool);

        let queued: Vec<_> = (0..3)
            .map(|_| {
                let ran = Arc::clone(&ran);
                pool.submit(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        let stopper = thread::spawn({
            let pool = Arc::clone(&pool);
            move || pool.shutdown(ShutdownMode::Immediate)
        });

        // The queued tasks are cancelled while the running one is still blocked.
        for handle in &queued {
            handle.wait();
            assert_eq!(handle.state(), TaskState::Cancelled);
        }

        assert_eq!(running.state(), TaskState::Running);

        gate.signal();
        stopper.join().unwrap();

        assert_eq!(running.join(), Ok(()));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        for handle in queued {
            assert_eq!(handle.join(), Err(TaskError::Cancelled));
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn dropping_pool_cancels_queued_tasks() {
    with_watchdog(|| {
        let pool = ThreadPool::new(nz(1)).unwrap();
        let (gate, running) = occupy_worker(&pool);

        let queued = pool.submit(|| "never").unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            gate.signal();
        });

        drop(pool);
        releaser.join().unwrap();

        assert_eq!(running.join(), Ok(()));
        assert_eq!(queued.join(), Err(TaskError::Cancelled));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn cancel_removes_pending_task() {
    with_watchdog(|| {
        let pool = ThreadPool::new(nz(1)).unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        let (gate, _first) = occupy_worker(&pool);

        let victim = pool
            .submit({
                let ran = Arc::clone(&ran);
                move || ran.store(true, Ordering::SeqCst)
            })
            .unwrap();
        let survivor = pool.submit(|| 7).unwrap();

        assert_eq!(pool.queue_depth(), 2);
        assert!(pool.cancel(&victim));
        assert!(!pool.cancel(&victim));
        assert_eq!(pool.queue_depth(), 1);

        gate.signal();

        assert_eq!(survivor.join(), Ok(7));
        assert_eq!(victim.join(), Err(TaskError::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn cancel_with_handle_from_other_pool_does_nothing() {
    with_watchdog(|| {
        let busy_pool = ThreadPool::new(nz(1)).unwrap();
        let other_pool = ThreadPool::new(nz(1)).unwrap();

        let (gate, _first) = occupy_worker(&busy_pool);
        let queued = busy_pool.submit(|| 1).unwrap();

        assert!(!other_pool.cancel(&queued));

        gate.signal();
        assert_eq!(queued.join(), Ok(1));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn panic_is_captured_and_worker_survives() {
    with_watchdog(|| {
        let pool = ThreadPool::new(nz(1)).unwrap();

        let failed = pool
            .submit(|| -> u32 { panic!("deliberate task failure") })
            .unwrap();

        match failed.join() {
            Err(TaskError::Panicked { message }) => {
                assert_eq!(message, "deliberate task failure");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        pool.execute(|| panic!("nobody is watching")).unwrap();

        assert_eq!(pool.submit(|| 5).unwrap().join(), Ok(5));

        let stats = pool.worker_stats();
        assert_eq!(stats.stopped, 0);
        assert_eq!(stats.alive(), 1);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn drain_waits_for_queue_and_running_tasks() {
    with_watchdog(|| {
        let pool = ThreadPool::new(nz(2)).unwrap();
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let completed = Arc::clone(&completed);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(2));
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.drain();

        assert_eq!(completed.load(Ordering::SeqCst), 10);
        assert_eq!(pool.queue_depth(), 0);
        assert_eq!(pool.worker_stats().busy, 0);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn drain_timeout_expires_while_busy() {
    with_watchdog(|| {
        let pool = ThreadPool::new(nz(1)).unwrap();
        let (gate, first) = occupy_worker(&pool);

        assert_eq!(pool.worker_stats().busy, 1);
        assert_eq!(
            pool.drain_timeout(Duration::from_millis(10)),
            WaitOutcome::TimedOut
        );
        assert_eq!(
            first.wait_timeout(Duration::from_millis(10)),
            WaitOutcome::TimedOut
        );

        gate.signal();

        assert_eq!(
            pool.drain_timeout(Duration::from_secs(5)),
            WaitOutcome::Signaled
        );
        assert!(first.is_finished());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn shutdown_from_inside_a_task_does_not_deadlock() {
    with_watchdog(|| {
        let pool = Arc::new(ThreadPool::new(nz(2)).unwrap());

        let handle = pool
            .submit({
                let pool = Arc::clone(&pool);
                move || pool.shutdown(ShutdownMode::Graceful)
            })
            .unwrap();

        assert_eq!(handle.join(), Ok(()));
        assert!(pool.is_stopping());

        spin_until(|| pool.worker_stats().stopped == 2);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn graceful_shutdown_from_inside_a_task_still_runs_queued_tasks() {
    with_watchdog(|| {
        let pool = Arc::new(ThreadPool::new(nz(1)).unwrap());
        let gate = Arc::new(Event::manual_reset());
        let ran = Arc::new(AtomicUsize::new(0));

        let stopper = pool
            .submit({
                let pool = Arc::clone(&pool);
                let gate = Arc::clone(&gate);
                move || {
                    gate.wait();
                    pool.shutdown(ShutdownMode::Graceful);
                }
            })
            .unwrap();

        let queued: Vec<_> = (0..3)
            .map(|_| {
                let ran = Arc::clone(&ran);
                pool.submit(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        gate.signal();
        assert_eq!(stopper.join(), Ok(()));

        for handle in queued {
            assert_eq!(handle.join(), Ok(()));
        }

        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(matches!(pool.submit(|| ()), Err(Error::PoolStopped)));

        spin_until(|| pool.worker_stats().stopped == 1);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn unbounded_queue_keeps_growing_while_memory_lasts() {
    with_watchdog(|| {
        // Enough queued tasks to need thousands of allocator chunks.
        const TASKS: usize = 270_000;

        let pool = ThreadPool::new(nz(1)).unwrap();
        let (gate, blocker) = occupy_worker(&pool);
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..TASKS {
            let ran = Arc::clone(&ran);
            pool.execute(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        assert_eq!(pool.queue_depth(), TASKS);

        gate.signal();
        assert_eq!(blocker.join(), Ok(()));

        pool.drain();
        assert_eq!(ran.load(Ordering::Relaxed), TASKS);
    });
}
