//! Error types for the strand runtime
//!
//! Three classes of failure exist:
//!
//! - OS-call failures and bad configuration: returned as [`RuntimeError`].
//! - Application timeouts inside hooked calls: reported the libc way
//!   (`-1` + `ETIMEDOUT`), see `strand_runtime::hook`.
//! - Broken runtime invariants (double event registration, resuming a
//!   running fiber, ...): fatal, via [`strand_assert!`](crate::strand_assert).

use core::fmt;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors returned by runtime operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// `start()` called twice
    AlreadyStarted,

    /// Operation needs a running scheduler
    NotStarted,

    /// Configuration rejected by `validate()`
    Config(&'static str),

    /// Fiber stack could not be set up
    Stack(StackError),

    /// An OS call failed with this errno
    Os(i32),

    /// Operation timed out
    Timeout,

    /// Called outside a reactor worker thread
    NoReactor,
}

impl RuntimeError {
    /// Capture `errno` of the last failed libc call
    #[inline]
    pub fn last_os_error() -> Self {
        RuntimeError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::AlreadyStarted => write!(f, "scheduler already started"),
            RuntimeError::NotStarted => write!(f, "scheduler not started"),
            RuntimeError::Config(msg) => write!(f, "invalid config: {}", msg),
            RuntimeError::Stack(e) => write!(f, "stack error: {}", e),
            RuntimeError::Os(code) => {
                write!(f, "os error {}: {}", code, std::io::Error::from_raw_os_error(*code))
            }
            RuntimeError::Timeout => write!(f, "operation timed out"),
            RuntimeError::NoReactor => write!(f, "no reactor on this thread"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<RuntimeError> for std::io::Error {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Os(code) => std::io::Error::from_raw_os_error(code),
            RuntimeError::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, e),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

/// Stack allocation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// mmap failed
    AllocationFailed,

    /// mprotect on the guard page failed
    ProtectionFailed,

    /// Requested size below the minimum
    TooSmall,
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::AllocationFailed => write!(f, "stack allocation failed"),
            StackError::ProtectionFailed => write!(f, "guard page protection failed"),
            StackError::TooSmall => write!(f, "stack size below minimum"),
        }
    }
}

impl From<StackError> for RuntimeError {
    fn from(e: StackError) -> Self {
        RuntimeError::Stack(e)
    }
}

/// Fatal invariant check.
///
/// Logs the failed condition (plus an optional formatted message) at error
/// level and aborts the process. Used where continuing would corrupt a
/// fiber stack or double-fire a waiter.
#[macro_export]
macro_rules! strand_assert {
    ($cond:expr $(,)?) => {{
        if !$cond {
            $crate::kerror!("ASSERTION: {} at {}:{}", stringify!($cond), file!(), line!());
            ::std::process::abort();
        }
    }};
    ($cond:expr, $($arg:tt)+) => {{
        if !$cond {
            $crate::kerror!(
                "ASSERTION: {} at {}:{}: {}",
                stringify!($cond),
                file!(),
                line!(),
                format_args!($($arg)+)
            );
            ::std::process::abort();
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", RuntimeError::Timeout), "operation timed out");
        assert_eq!(
            format!("{}", RuntimeError::Stack(StackError::AllocationFailed)),
            "stack error: stack allocation failed"
        );
        assert!(format!("{}", RuntimeError::Os(libc_eagain())).starts_with("os error"));
    }

    #[test]
    fn test_error_conversion() {
        let e: RuntimeError = StackError::TooSmall.into();
        assert!(matches!(e, RuntimeError::Stack(StackError::TooSmall)));

        let io: std::io::Error = RuntimeError::Timeout.into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_assert_passes() {
        strand_assert!(1 + 1 == 2);
        strand_assert!(true, "value {}", 3);
    }

    // EAGAIN on Linux
    fn libc_eagain() -> i32 {
        11
    }
}
