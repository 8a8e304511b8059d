//! Fibers: stackful coroutines
//!
//! A fiber owns one mmap'd stack, a saved register context and a state.
//! Two kinds exist:
//!
//! - task fibers, created with [`Fiber::new`], which run a closure;
//! - root fibers (id 0), created lazily by [`Fiber::current`], which stand
//!   for the OS thread's own stack and own no stack mapping.
//!
//! Fibers switch against one of two partners. `swap_in`/`swap_out` pair a
//! fiber with the thread's scheduler fiber (the normal worker path), while
//! `call`/`back` pair it with the thread's root fiber (the `use_caller`
//! bootstrap path).
//!
//! Exactly one fiber per thread is current; the pointer lives in [`tls`].
//! A running fiber is kept alive by whoever switched into it, so the
//! current-fiber slot only borrows.

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use strand_core::{FiberId, FiberState, RuntimeResult, kerror, kprint, kwarn, strand_assert};

use crate::arch::{self, Context};
use crate::config;
use crate::stack::Stack;
use crate::tls;

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Live fiber count, root fibers included
static LIVE: AtomicU64 = AtomicU64::new(0);

pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    ctx: UnsafeCell<Context>,
    stack: Option<Stack>,
    entry: UnsafeCell<Option<Entry>>,
    use_caller: bool,
}

// The context and entry cells are only touched by the thread that runs the
// fiber, or by its owner while the fiber is not running (Init/Term/Except).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a task fiber in `Init`.
    ///
    /// `stack_size == 0` uses the configured default. `use_caller` fibers
    /// return to the thread's root fiber when done instead of the scheduler
    /// fiber.
    pub fn new<F>(f: F, stack_size: usize, use_caller: bool) -> RuntimeResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_entry(Box::new(f), stack_size, use_caller)
    }

    pub(crate) fn with_entry(
        entry: Entry,
        stack_size: usize,
        use_caller: bool,
    ) -> RuntimeResult<Arc<Fiber>> {
        let size = if stack_size == 0 { config::global().stack_size } else { stack_size };
        let stack = Stack::new(size)?;
        let top = stack.top();

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            ctx: UnsafeCell::new(Context::default()),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(entry)),
            use_caller,
        });
        unsafe {
            arch::init_context(&mut *fiber.ctx.get(), top, fiber_entry, Arc::as_ptr(&fiber) as usize);
        }
        LIVE.fetch_add(1, Ordering::Relaxed);
        Ok(fiber)
    }

    fn root() -> Arc<Fiber> {
        LIVE.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::ROOT,
            state: AtomicU8::new(FiberState::Exec as u8),
            ctx: UnsafeCell::new(Context::default()),
            stack: None,
            entry: UnsafeCell::new(None),
            use_caller: false,
        })
    }

    /// The fiber running on this thread, creating the root fiber on first use
    pub fn current() -> Arc<Fiber> {
        let ptr = tls::current_fiber_ptr();
        if !ptr.is_null() {
            // SAFETY: the current fiber is kept alive by its resumer.
            unsafe {
                Arc::increment_strong_count(ptr);
                return Arc::from_raw(ptr);
            }
        }
        Self::thread_root()
    }

    /// Root fiber of this thread
    fn thread_root() -> Arc<Fiber> {
        let ptr = tls::thread_fiber_ptr();
        if !ptr.is_null() {
            unsafe {
                Arc::increment_strong_count(ptr);
                return Arc::from_raw(ptr);
            }
        }
        let root = Fiber::root();
        tls::install_thread_fiber(root.clone());
        if tls::current_fiber_ptr().is_null() {
            tls::set_current_fiber(Arc::as_ptr(&root));
        }
        root
    }

    /// Id of the running fiber, 0 outside task fibers
    pub fn current_id() -> u64 {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            0
        } else {
            unsafe { (*ptr).id.as_u64() }
        }
    }

    /// Number of fibers alive in the process
    pub fn total() -> u64 {
        LIVE.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move `from` to `to` only if the state is still `from`
    #[inline]
    pub(crate) fn transition(&self, from: FiberState, to: FiberState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Base of the stack mapping; identifies the allocation across `reset`
    pub fn stack_base(&self) -> Option<*const u8> {
        self.stack.as_ref().map(Stack::base)
    }

    /// Rearm a finished (or never started) fiber with a new closure,
    /// keeping its stack.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_entry(Box::new(f));
    }

    pub(crate) fn reset_entry(&self, entry: Entry) {
        let state = self.state();
        strand_assert!(
            self.stack.is_some() && state.is_resettable(),
            "reset of fiber {} in state {}",
            self.id,
            state
        );
        let Some(stack) = self.stack.as_ref() else { return };
        unsafe {
            *self.entry.get() = Some(entry);
            arch::init_context(&mut *self.ctx.get(), stack.top(), fiber_entry, self as *const Fiber as usize);
        }
        self.set_state(FiberState::Init);
    }

    fn assert_resumable(&self) {
        let state = self.state();
        strand_assert!(
            state != FiberState::Exec && !state.is_terminal() && self.stack.is_some(),
            "fiber {} cannot be resumed from state {}",
            self.id,
            state
        );
    }

    /// Switch from the thread's scheduler fiber into this fiber.
    pub fn swap_in(self: &Arc<Self>) {
        self.assert_resumable();
        let main = sched_fiber();
        self.enter();
        unsafe { arch::switch_context((*main).ctx.get(), self.ctx.get()) };
    }

    /// Switch from this fiber back to the thread's scheduler fiber.
    pub fn swap_out(&self) {
        let main = sched_fiber();
        unsafe {
            leave_to(main);
            arch::switch_context(self.ctx.get(), (*main).ctx.get());
        }
    }

    /// Switch from the thread's root fiber into this fiber.
    pub fn call(self: &Arc<Self>) {
        self.assert_resumable();
        let root = Self::thread_root();
        self.enter();
        unsafe { arch::switch_context(root.ctx.get(), self.ctx.get()) };
    }

    /// Switch from this fiber back to the thread's root fiber.
    pub fn back(&self) {
        let root = tls::thread_fiber_ptr();
        strand_assert!(!root.is_null(), "back() on a thread without a root fiber");
        unsafe {
            leave_to(root);
            arch::switch_context(self.ctx.get(), (*root).ctx.get());
        }
    }

    fn enter(&self) {
        tls::set_current_fiber(self as *const Fiber);
        self.set_state(FiberState::Exec);
        kprint::set_fiber_id(self.id.as_u64());
    }

    /// Suspend the running fiber and ask the scheduler to run it again.
    pub fn yield_to_ready() {
        let cur = running_task();
        unsafe {
            (*cur).set_state(FiberState::Ready);
            (*cur).swap_out();
        }
    }

    /// Suspend the running fiber without requeueing it.
    ///
    /// The fiber stays `Exec` until the scheduler loop regains control and
    /// marks it `Hold`, so a waker that fires early cannot resume it while
    /// its context is still being saved.
    pub fn yield_to_hold() {
        let cur = running_task();
        unsafe { (*cur).swap_out() };
    }
}

/// Fiber the scheduler loop runs on, falling back to the thread root
fn sched_fiber() -> *const Fiber {
    let main = tls::sched_fiber_ptr();
    if !main.is_null() {
        return main;
    }
    let _ = Fiber::thread_root();
    tls::thread_fiber_ptr()
}

/// # Safety
///
/// `to` must point at a live fiber.
unsafe fn leave_to(to: *const Fiber) {
    tls::set_current_fiber(to);
    kprint::set_fiber_id((*to).id.as_u64());
}

fn running_task() -> *const Fiber {
    let cur = tls::current_fiber_ptr();
    strand_assert!(!cur.is_null(), "yield outside a fiber");
    let (state, has_stack) = unsafe { ((*cur).state(), (*cur).stack.is_some()) };
    strand_assert!(
        has_stack && state == FiberState::Exec,
        "yield from fiber {} in state {}",
        Fiber::current_id(),
        state
    );
    cur
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_none() {
            return;
        }
        let state = self.state();
        strand_assert!(
            state != FiberState::Exec,
            "fiber {} dropped while running",
            self.id
        );
        if !state.is_resettable() {
            kwarn!("fiber {} dropped while {}; its stack frames are discarded", self.id, state);
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack", &self.stack)
            .finish()
    }
}

extern "C" fn fiber_entry(arg: usize) {
    // SAFETY: `arg` is the fiber's own address, and whoever resumed it
    // holds a strong reference until it switches away for good.
    let fiber = unsafe { &*(arg as *const Fiber) };

    let entry = unsafe { (*fiber.entry.get()).take() };
    if let Some(entry) = entry {
        match panic::catch_unwind(AssertUnwindSafe(entry)) {
            Ok(()) => fiber.set_state(FiberState::Term),
            Err(payload) => {
                kerror!("fiber {} panicked: {}", fiber.id, panic_message(&*payload));
                fiber.set_state(FiberState::Except);
            }
        }
    } else {
        fiber.set_state(FiberState::Term);
    }

    if fiber.use_caller {
        fiber.back();
    } else {
        fiber.swap_out();
    }
    kerror!("terminated fiber {} was resumed", fiber.id);
    std::process::abort();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_root_fiber() {
        std::thread::spawn(|| {
            let root = Fiber::current();
            assert!(root.id().is_root());
            assert_eq!(root.state(), FiberState::Exec);
            assert!(root.stack_base().is_none());
            assert!(Arc::ptr_eq(&root, &Fiber::current()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_run_to_term_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let fiber = Fiber::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }, 0, false)
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Init);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(Fiber::current_id(), 0);
    }

    #[test]
    fn test_yield_and_resume() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let t = trace.clone();
        let fiber = Fiber::new(move || {
            t.lock().push(1);
            Fiber::yield_to_hold();
            t.lock().push(3);
            Fiber::yield_to_ready();
            t.lock().push(5);
        }, 0, false)
        .unwrap();

        fiber.swap_in();
        // the scheduler loop would mark it Hold
        assert_eq!(fiber.state(), FiberState::Exec);
        fiber.set_state(FiberState::Hold);
        trace.lock().push(2);

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Ready);
        trace.lock().push(4);

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*trace.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_current_inside_fiber() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let fiber = Fiber::new(move || {
            let me = Fiber::current();
            *s.lock() = Some((me.id(), me.state(), Fiber::current_id()));
        }, 0, false)
        .unwrap();
        fiber.swap_in();

        let (id, state, raw) = seen.lock().take().unwrap();
        assert_eq!(id, fiber.id());
        assert_eq!(state, FiberState::Exec);
        assert_eq!(raw, fiber.id().as_u64());
    }

    #[test]
    fn test_panic_becomes_except() {
        let fiber = Fiber::new(|| panic!("boom"), 0, false).unwrap();
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Except);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let s = states.clone();
        let fiber = Fiber::new(move || s.lock().push(Fiber::current().state()), 0, false).unwrap();
        let base = fiber.stack_base();

        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);

        let s = states.clone();
        fiber.reset(move || s.lock().push(Fiber::current().state()));
        assert_eq!(fiber.state(), FiberState::Init);
        fiber.swap_in();
        assert_eq!(fiber.state(), FiberState::Term);

        assert_eq!(fiber.stack_base(), base);
        assert_eq!(*states.lock(), vec![FiberState::Exec, FiberState::Exec]);
    }

    #[test]
    fn test_call_and_back() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, 0, true)
        .unwrap();
        fiber.call();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_total_counts_live_fibers() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        assert!(Fiber::total() >= 1);
        fiber.swap_in();
        drop(fiber);
    }
}
