//! # strand - cooperative fibers on an epoll reactor
//!
//! Stackful fibers multiplexed onto a small pool of OS threads. Blocking
//! calls made through [`hook`] (or the [`net`] types built on it) suspend
//! the calling fiber instead of the thread, so straight-line socket code
//! scales like an event loop.
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::{Runtime, RuntimeConfig};
//!
//! fn main() {
//!     let runtime = Runtime::new(RuntimeConfig::from_env().num_threads(4)).unwrap();
//!
//!     runtime.spawn(|| {
//!         strand::sleep(std::time::Duration::from_millis(10));
//!         println!("woke up in fiber {}", strand::current_id());
//!     }).unwrap();
//!
//!     // drains queued fibers, pending I/O and timers, then joins
//!     runtime.shutdown();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              User code: spawn(), net, hook::*                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Reactor = Scheduler + TimerManager + epoll + fd contexts   │
//! └─────────────────────────────────────────────────────────────┘
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  Thread   │      │  Thread   │      │ (optional)│
//!    └───────────┘      └───────────┘      └───────────┘
//!          │  idle: epoll_wait(min(next timer, max_wait))
//!          ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │   Fibers: mmap'd stacks + guard page, asm context swap  │
//!    └─────────────────────────────────────────────────────────┘
//! ```

pub mod net;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

// Re-export core types
pub use strand_core::{Event, FiberId, FiberState, RuntimeError, RuntimeResult, StackError};
pub use strand_core::constants::{ANY_THREAD, INFINITE};

// Re-export kprint macros for logging
pub use strand_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use strand_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use strand_core::{env_get, env_get_bool, env_get_ms, env_get_opt};

// Re-export runtime types
pub use strand_runtime::{
    config,
    hook,
    Callback,
    Fiber,
    FdTable,
    Reactor,
    RuntimeConfig,
    Schedule,
    Scheduler,
    Task,
    TimeoutKind,
    Timer,
    TimerManager,
};

/// Owns a started [`Reactor`] and stops it on drop.
///
/// With `use_caller` the creating thread is one of the workers; the runtime
/// must then be shut down (or dropped) on that same thread.
pub struct Runtime {
    reactor: Arc<Reactor>,
}

impl Runtime {
    /// Start a reactor sized by `config`.
    ///
    /// The first runtime also installs `config` as the process-wide
    /// configuration (stack size, epoll limits, timeouts); later ones only
    /// take their thread settings from it.
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        config.validate()?;
        let (threads, use_caller) = (config.num_threads, config.use_caller);
        if config::install(config).is_err() {
            kdebug!("runtime: process configuration already set, keeping it");
        }
        let reactor = Reactor::new(threads, use_caller, "strand")?;
        Ok(Self { reactor })
    }

    /// Runtime configured from `STRAND_*` environment variables
    pub fn from_env() -> RuntimeResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Run `f` in a new fiber on any worker
    pub fn spawn<F>(&self, f: F) -> RuntimeResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_on(ANY_THREAD, f)
    }

    /// Run `f` in a new fiber pinned to worker `thread` (a kernel tid)
    pub fn spawn_on<F>(&self, thread: i32, f: F) -> RuntimeResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Fiber::new(f, 0, false)?;
        self.reactor.scheduler().schedule_fiber(fiber.clone(), thread);
        Ok(fiber)
    }

    /// Run `f` in a fiber, shut down, and hand back its result.
    ///
    /// Returns `None` if `f` panicked.
    pub fn run<F, T>(self, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        if let Err(e) = self.spawn(move || *out.lock() = Some(f())) {
            kerror!("runtime: spawn failed: {}", e);
        }
        self.shutdown();
        let result = slot.lock().take();
        result
    }

    /// Wait for queued work, pending I/O and timers, then join the workers
    pub fn shutdown(&self) {
        self.reactor.stop();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn a fiber on the scheduler the calling thread works for
pub fn spawn<F>(f: F) -> RuntimeResult<Arc<Fiber>>
where
    F: FnOnce() + Send + 'static,
{
    let sched = Scheduler::current().ok_or(RuntimeError::NotStarted)?;
    let fiber = Fiber::new(f, 0, false)?;
    sched.scheduler().schedule_fiber(fiber.clone(), ANY_THREAD);
    Ok(fiber)
}

/// Requeue the running fiber behind other ready work.
///
/// Must be called from inside a fiber.
#[inline]
pub fn yield_now() {
    Fiber::yield_to_ready();
}

/// Id of the running fiber, 0 outside a task fiber
#[inline]
pub fn current_id() -> u64 {
    Fiber::current_id()
}

/// Sleep without blocking the worker when called from a reactor fiber
pub fn sleep(d: Duration) {
    let req = libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    };
    hook::nanosleep(&req, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn runtime(threads: usize) -> Runtime {
        Runtime::new(RuntimeConfig::new().num_threads(threads).use_caller(false)).unwrap()
    }

    #[test]
    fn test_run_returns_value() {
        let rt = runtime(2);
        assert_eq!(rt.run(|| 6 * 7), Some(42));
    }

    #[test]
    fn test_run_panic_is_none() {
        let rt = runtime(1);
        let out: Option<u32> = rt.run(|| panic!("boom"));
        assert_eq!(out, None);
    }

    #[test]
    fn test_nested_spawn_and_yield() {
        let rt = runtime(2);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        rt.spawn(move || {
            for _ in 0..10 {
                let c = c.clone();
                spawn(move || {
                    yield_now();
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        })
        .unwrap();
        rt.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_sleeping_fibers_overlap() {
        let rt = runtime(1);
        let start = Instant::now();
        for _ in 0..5 {
            rt.spawn(|| sleep(Duration::from_millis(50))).unwrap();
        }
        rt.shutdown();
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_spawn_outside_runtime() {
        assert_eq!(spawn(|| {}).unwrap_err(), RuntimeError::NotStarted);
    }
}
