//! Basic strand example
//!
//! Spawns fibers that yield to each other, sleeps without blocking the
//! workers, and drives a recurring timer.
//!
//! # Environment Variables
//!
//! - `STRAND_FLUSH_EPRINT=1` - Flush log output immediately (useful for crash debugging)
//! - `STRAND_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `STRAND_NUM_THREADS=4` - Worker threads

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strand::{kdebug, kinfo, spawn, yield_now, Runtime, RuntimeConfig};

// STRAND_LOG_LEVEL=debug STRAND_FLUSH_EPRINT=1 cargo run -p strand-basic
fn main() {
    println!("=== strand basic example ===\n");

    let config = RuntimeConfig::from_env().num_threads(3).use_caller(true);
    config.print();
    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let completed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    // Fibers that take turns
    for i in 1..=3 {
        let c = completed.clone();
        let spawned = runtime.spawn(move || {
            kdebug!("[fiber {}] started", i);
            for j in 0..3 {
                kdebug!("[fiber {}] iteration {}", i, j);
                yield_now();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
        match spawned {
            Ok(fiber) => println!("spawned fiber {} (id={})", i, fiber.id()),
            Err(e) => eprintln!("spawn failed: {}", e),
        }
    }

    // Sleepers overlap: total time is one sleep, not four
    for i in 0..4 {
        let c = completed.clone();
        let _ = runtime.spawn(move || {
            strand::sleep(Duration::from_millis(200));
            kdebug!("[sleeper {}] woke", i);
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    // A fiber spawning children from inside the runtime
    let c = completed.clone();
    let _ = runtime.spawn(move || {
        for _ in 0..2 {
            let c = c.clone();
            let _ = spawn(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    // Recurring timer, cancelled by itself after five ticks
    let ticks = Arc::new(AtomicUsize::new(0));
    let slot = Arc::new(std::sync::Mutex::new(None::<Arc<strand::Timer>>));
    let (t, s) = (ticks.clone(), slot.clone());
    let timer = runtime.reactor().add_timer(
        50,
        move || {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            kinfo!("tick {}", n);
            if n == 5 {
                if let Some(timer) = s.lock().ok().and_then(|mut g| g.take()) {
                    timer.cancel();
                }
            }
        },
        true,
    );
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(timer);
    }

    runtime.shutdown();

    println!(
        "\n{} task(s) completed, {} tick(s), {:?} elapsed",
        completed.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst),
        start.elapsed()
    );
    println!("=== example complete ===");
}
