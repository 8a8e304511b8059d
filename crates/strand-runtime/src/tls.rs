//! Thread-local runtime state
//!
//! One slot per OS thread for each "who am I" query: the running fiber, the
//! thread's root fiber, the fiber that runs the scheduler loop, the current
//! scheduler and the hook switch. Scheduler threads set them on entry and
//! clear them on exit.
//!
//! Accessors are `#[inline(never)]`: a fiber can be resumed on a different
//! OS thread, and an inlined access could reuse a thread pointer computed
//! before the switch.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::scheduler::Schedule;

thread_local! {
    /// Fiber executing on this thread (borrowed; kept alive by its resumer)
    static CURRENT: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Root fiber standing for the OS thread itself (owned)
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber running the scheduler loop; `swap_in`/`swap_out` switch against it
    static SCHED_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Scheduler this thread works for
    static SCHEDULER: RefCell<Option<Weak<dyn Schedule>>> = const { RefCell::new(None) };

    /// Cached kernel thread id
    static TID: Cell<i32> = const { Cell::new(0) };

    /// Hooked I/O enabled on this thread
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline(never)]
pub(crate) fn current_fiber_ptr() -> *const Fiber {
    CURRENT.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_current_fiber(fiber: *const Fiber) {
    CURRENT.with(|c| c.set(fiber));
}

/// Root fiber of this thread, if one was created
#[inline(never)]
pub(crate) fn thread_fiber_ptr() -> *const Fiber {
    THREAD_FIBER.with(|t| t.borrow().as_ref().map_or(std::ptr::null(), Arc::as_ptr))
}

#[inline(never)]
pub(crate) fn install_thread_fiber(fiber: Arc<Fiber>) {
    THREAD_FIBER.with(|t| *t.borrow_mut() = Some(fiber));
}

#[inline(never)]
pub(crate) fn sched_fiber_ptr() -> *const Fiber {
    SCHED_FIBER.with(|c| c.get())
}

#[inline(never)]
pub(crate) fn set_sched_fiber(fiber: *const Fiber) {
    SCHED_FIBER.with(|c| c.set(fiber));
}

#[inline(never)]
pub(crate) fn scheduler() -> Option<Arc<dyn Schedule>> {
    SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

#[inline(never)]
pub(crate) fn set_scheduler(owner: Option<Weak<dyn Schedule>>) {
    SCHEDULER.with(|s| *s.borrow_mut() = owner);
}

/// Kernel thread id of the calling thread
#[inline(never)]
pub fn thread_id() -> i32 {
    TID.with(|t| {
        if t.get() == 0 {
            t.set(unsafe { libc::syscall(libc::SYS_gettid) } as i32);
        }
        t.get()
    })
}

#[inline(never)]
pub(crate) fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

#[inline(never)]
pub(crate) fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|h| h.set(enabled));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable_and_distinct() {
        let me = thread_id();
        assert!(me > 0);
        assert_eq!(me, thread_id());

        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(me, other);
    }

    #[test]
    fn test_slots_start_empty() {
        std::thread::spawn(|| {
            assert!(current_fiber_ptr().is_null());
            assert!(sched_fiber_ptr().is_null());
            assert!(scheduler().is_none());
            assert!(!hook_enabled());
        })
        .join()
        .unwrap();
    }
}
