//! # strand-runtime
//!
//! Linux runtime for the strand fiber scheduler.
//!
//! This crate provides:
//! - Fiber stacks (mmap with a guard page) and context switching
//!   (architecture-specific assembly)
//! - Fibers and their state machine
//! - The N:M scheduler with thread affinity
//! - Timer manager
//! - Epoll reactor that resumes fibers on fd readiness and timer expiry
//! - Descriptor table and hooked blocking calls

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("strand-runtime requires Linux (epoll)");
    }
}

pub mod config;
pub mod arch;
pub mod stack;
pub mod tls;
pub mod fiber;
pub mod timer;
pub mod scheduler;
pub mod reactor;
pub mod fd_table;
pub mod hook;

// Re-exports
pub use config::RuntimeConfig;
pub use fiber::Fiber;
pub use scheduler::{Callback, Schedule, Scheduler, Task, WorkItem};
pub use reactor::Reactor;
pub use timer::{Clock, SystemClock, Timer, TimerCallback, TimerManager};
pub use fd_table::{FdCtx, FdTable, TimeoutKind};
pub use tls::thread_id;
