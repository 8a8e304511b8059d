//! Architecture-specific context switching
//!
//! Each backend provides a `#[repr(C)]` [`Context`] holding the callee-saved
//! registers, `init_context` to prepare a fresh stack, and `switch_context`
//! to save the running context and resume another.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{Context, init_context, switch_context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::{Context, init_context, switch_context};
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Entry point of a fresh context; receives the `arg` given to `init_context`.
///
/// Must never return: the trampoline traps if it does.
pub type EntryFn = extern "C" fn(usize);
