//! # strand-core
//!
//! Core types for the strand fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stacks, context switching, the scheduler and the epoll reactor live in
//! `strand-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state machine
//! - `event` - Read/write interest mask used by the reactor
//! - `error` - Error types and the fatal `strand_assert!` macro
//! - `kprint` - Kernel-style debug printing macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod event;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use event::Event;
pub use error::{RuntimeError, RuntimeResult, StackError};
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt};

/// Shared constants
pub mod constants {
    /// Page size assumed for guard pages
    pub const PAGE_SIZE: usize = 4096;

    /// Smallest stack the runtime accepts
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// "No timer pending" / "no timeout configured"
    pub const INFINITE: u64 = u64::MAX;

    /// Thread affinity meaning "any worker"
    pub const ANY_THREAD: i32 = -1;
}
