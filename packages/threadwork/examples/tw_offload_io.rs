//! Offloads blocking file reads to a thread pool while the main thread stays responsive.
//!
//! Logs at `debug` level, so worker lifecycle events show up alongside the read results.

use std::fs;
use std::num::NonZero;
use std::path::PathBuf;

use threadwork::{FullQueuePolicy, ShutdownMode, ThreadPool};
use tracing::{Level, info};

const FILE_COUNT: usize = 8;

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let directory = std::env::temp_dir().join(format!("threadwork-offload-{}", std::process::id()));
    fs::create_dir_all(&directory).unwrap();

    let paths: Vec<PathBuf> = (0..FILE_COUNT)
        .map(|index| {
            let path = directory.join(format!("file-{index}.txt"));
            fs::write(&path, "x".repeat(index.saturating_add(1).saturating_mul(1024))).unwrap();
            path
        })
        .collect();

    let pool = ThreadPool::builder()
        .worker_count(NonZero::new(3).unwrap())
        .queue_capacity(NonZero::new(4).unwrap())
        .when_full(FullQueuePolicy::Block)
        .thread_name_prefix("file-io")
        .build()
        .unwrap();

    // With a queue of 4 and 3 workers, some of these submissions wait for space.
    let handles: Vec<_> = paths
        .iter()
        .cloned()
        .map(|path| {
            pool.submit(move || fs::read(&path).map(|contents| (path, contents.len())))
                .unwrap()
        })
        .collect();

    info!(
        queue_depth = pool.queue_depth(),
        "all reads submitted; main thread is free to do other work"
    );

    let mut total_bytes = 0_usize;

    for handle in handles {
        let (path, len) = handle.join().unwrap().unwrap();
        info!(path = %path.display(), len, "read finished");
        total_bytes = total_bytes.saturating_add(len);
    }

    println!("Read {total_bytes} bytes from {FILE_COUNT} files on the pool");

    pool.shutdown(ShutdownMode::Graceful);

    fs::remove_dir_all(&directory).unwrap();
}
