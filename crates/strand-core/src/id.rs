//! Fiber identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic fiber identifier
///
/// Task fibers get ids starting at 1. The value 0 is reserved for the
/// per-thread root fiber, which stands for the OS thread itself.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    /// Id of a thread root fiber
    pub const ROOT: FiberId = FiberId(0);

    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        FiberId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is a thread root fiber
    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "FiberId(ROOT)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
