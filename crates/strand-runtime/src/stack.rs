//! Fiber stacks
//!
//! Each stack is its own anonymous mapping with a `PROT_NONE` guard page at
//! the low end, so an overflow faults instead of corrupting a neighbour.

use strand_core::constants::{MIN_STACK_SIZE, PAGE_SIZE};
use strand_core::{StackError, kdebug};

/// An owned, guard-protected stack mapping.
///
/// Never aliased: the owning fiber is the only holder, and the mapping is
/// released on drop.
pub struct Stack {
    base: *mut u8,
    /// Total mapping length, guard page included
    len: usize,
}

// The mapping is plain memory owned by one fiber at a time.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack with `size` usable bytes (rounded up to whole pages).
    pub fn new(size: usize) -> Result<Self, StackError> {
        if size < MIN_STACK_SIZE {
            return Err(StackError::TooSmall);
        }
        let usable = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let len = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::AllocationFailed);
        }

        // Stack grows down: the guard sits at the lowest page.
        let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, len) };
            return Err(StackError::ProtectionFailed);
        }

        kdebug!("stack mapped at {:p} ({} bytes)", base, usable);
        Ok(Self { base: base as *mut u8, len })
    }

    /// Lowest address of the mapping; stable for the stack's lifetime
    #[inline]
    pub fn base(&self) -> *const u8 {
        self.base
    }

    /// One past the highest usable byte
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    /// Usable bytes, guard page excluded
    #[inline]
    pub fn size(&self) -> usize {
        self.len - PAGE_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding_and_bounds() {
        let stack = Stack::new(MIN_STACK_SIZE + 1).unwrap();
        assert_eq!(stack.size(), MIN_STACK_SIZE + PAGE_SIZE);
        assert_eq!(stack.top() as usize - stack.base() as usize, stack.size() + PAGE_SIZE);
    }

    #[test]
    fn test_too_small() {
        assert_eq!(Stack::new(1024).unwrap_err(), StackError::TooSmall);
    }

    #[test]
    fn test_usable_region_writable() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        unsafe {
            let last = stack.top().sub(1);
            *last = 0xAB;
            let first = stack.base().add(PAGE_SIZE) as *mut u8;
            *first = 0xCD;
            assert_eq!(*last, 0xAB);
            assert_eq!(*first, 0xCD);
        }
    }
}
