//! N:M fiber scheduler
//!
//! A fixed pool of OS threads drains one shared queue of work items. Each
//! item is a fiber to resume or a callback to run inside a scratch fiber,
//! optionally pinned to one thread by its kernel tid.
//!
//! Two startup modes exist. With `use_caller` the constructing thread counts
//! as a worker: a root fiber runs the scheduler loop on it while `stop()`
//! drains the queue. Otherwise every worker is a spawned thread.
//!
//! Specialisations (the I/O reactor) plug in through the [`Schedule`]
//! trait: they own a [`Scheduler`] and override `tickle`, `stopping` and
//! `idle`.
//!
//! # Per-thread loop
//!
//! ```text
//!   scan queue ──► fiber?     swap_in ──► Ready: requeue / else Hold
//!       │     └──► callback?  scratch fiber (reset, not reallocated)
//!       ▼
//!   nothing runnable ──► idle fiber ──► Term once stopping() holds
//! ```

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use strand_core::constants::ANY_THREAD;
use strand_core::{FiberState, RuntimeError, RuntimeResult, kdebug, kerror, kinfo, kprint, strand_assert};

use crate::config;
use crate::fiber::Fiber;
use crate::tls;

/// Callback work item
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// What a work item runs
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Self {
        Task::Fiber(fiber)
    }
}

impl From<Callback> for Task {
    fn from(cb: Callback) -> Self {
        Task::Call(cb)
    }
}

/// A task plus its thread affinity (`ANY_THREAD` = any worker)
pub struct WorkItem {
    pub task: Task,
    pub thread: i32,
}

/// Override seam for scheduler specialisations.
///
/// The scheduler loop calls back into its owner through this trait, so a
/// reactor can replace the idle behaviour and wake-up mechanism while
/// reusing the queue and thread management.
pub trait Schedule: Send + Sync + 'static {
    /// The embedded base scheduler
    fn scheduler(&self) -> &Scheduler;

    /// Wake an idle worker so it rescans the queue
    fn tickle(&self) {
        self.scheduler().wake_idle();
    }

    /// True once the scheduler may shut down
    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Body of each worker's idle fiber; returning ends that worker
    fn idle(&self) {
        let sched = self.scheduler();
        while !self.stopping() {
            sched.park();
            Fiber::yield_to_hold();
        }
    }

    /// Whether workers run with hooked I/O enabled
    fn hooks_io(&self) -> bool {
        false
    }

    /// Upcast for `current()` lookups of a concrete scheduler type
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<WorkItem>>,
    /// Parks idle workers of a plain scheduler; paired with `queue`
    wakeup: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<i32>>,
    /// Threads to spawn (the caller is not counted)
    spawn_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    stopped: AtomicBool,
    /// Kernel tid of the caller thread in `use_caller` mode, else -1
    root_thread: i32,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    owner: Weak<dyn Schedule>,
}

impl Scheduler {
    /// Plain scheduler whose idle workers park on a condition variable.
    ///
    /// `threads` counts the caller when `use_caller` is set.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let owner: Weak<dyn Schedule> = weak.clone();
            Scheduler::with_owner(threads, use_caller, name, owner)
        })
    }

    /// Base scheduler embedded in `owner`, which receives the loop callbacks
    pub fn with_owner(
        threads: usize,
        use_caller: bool,
        name: &str,
        owner: Weak<dyn Schedule>,
    ) -> Scheduler {
        strand_assert!(threads > 0, "scheduler {} needs at least one thread", name);
        let (spawn_count, root_thread) = if use_caller {
            (threads - 1, tls::thread_id())
        } else {
            (threads, -1)
        };
        let thread_ids = if use_caller { vec![root_thread] } else { Vec::new() };

        Scheduler {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            threads: Mutex::new(Vec::with_capacity(spawn_count)),
            thread_ids: Mutex::new(thread_ids),
            spawn_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            root_thread,
            root_fiber: Mutex::new(None),
            owner,
        }
    }

    /// Scheduler the calling thread works for
    pub fn current() -> Option<Arc<dyn Schedule>> {
        tls::scheduler()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel tids of all workers, the caller first in `use_caller` mode
    pub fn thread_ids(&self) -> Vec<i32> {
        self.thread_ids.lock().clone()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    fn is_current(&self) -> bool {
        tls::scheduler().is_some_and(|s| std::ptr::eq(s.scheduler(), self))
    }

    fn owner(&self) -> Option<Arc<dyn Schedule>> {
        self.owner.upgrade()
    }

    pub(crate) fn owner_weak(&self) -> Weak<dyn Schedule> {
        self.owner.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Spawn the worker threads; in `use_caller` mode also prepare the
    /// caller's root fiber.
    pub fn start(&self) -> RuntimeResult<()> {
        let owner = self.owner().ok_or(RuntimeError::NotStarted)?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyStarted);
        }
        self.stopping.store(false, Ordering::SeqCst);

        if self.root_thread != -1 {
            strand_assert!(
                tls::thread_id() == self.root_thread,
                "use_caller scheduler {} started off its creating thread",
                self.name
            );
            strand_assert!(
                tls::scheduler().is_none(),
                "thread already works for a scheduler"
            );
            let weak = self.owner.clone();
            let root = Fiber::new(
                move || {
                    if let Some(owner) = weak.upgrade() {
                        owner.scheduler().run(&owner);
                    }
                },
                0,
                true,
            )?;
            let _ = Fiber::current();
            tls::set_scheduler(Some(self.owner.clone()));
            tls::set_sched_fiber(Arc::as_ptr(&root));
            *self.root_fiber.lock() = Some(root);
        }

        let (tx, rx) = mpsc::channel();
        {
            let mut handles = self.threads.lock();
            for i in 0..self.spawn_count {
                let owner = owner.clone();
                let tx = tx.clone();
                let thread_name = format!("{}-{}", self.name, i);
                let handle = thread::Builder::new()
                    .name(thread_name.clone())
                    .spawn(move || {
                        kprint::set_thread_name(&thread_name);
                        let _ = tx.send(tls::thread_id());
                        drop(tx);
                        owner.scheduler().run(&owner);
                        kprint::clear_thread_name();
                    })
                    .map_err(|e| RuntimeError::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;
                handles.push(handle);
            }
        }
        drop(tx);

        let mut ids = self.thread_ids.lock();
        while let Ok(tid) = rx.recv() {
            ids.push(tid);
        }
        kinfo!(
            "scheduler {} started: {} thread(s){}",
            self.name,
            self.spawn_count,
            if self.root_thread != -1 { " + caller" } else { "" }
        );
        Ok(())
    }

    /// Shut down once all queued work has run, then join the workers.
    ///
    /// A `use_caller` scheduler must be stopped from its creating thread,
    /// which drains the queue itself before returning.
    pub fn stop(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(owner) = self.owner() else { return };
        self.auto_stop.store(true, Ordering::SeqCst);

        let root = self.root_fiber.lock().clone();
        if let Some(root) = &root {
            let idle_root = matches!(root.state(), FiberState::Init | FiberState::Term);
            if self.spawn_count == 0 && idle_root {
                self.stopping.store(true, Ordering::SeqCst);
                if owner.stopping() {
                    self.finish_stop();
                    return;
                }
            }
        }

        if self.root_thread != -1 {
            strand_assert!(
                tls::thread_id() == self.root_thread,
                "use_caller scheduler {} must be stopped on its creating thread",
                self.name
            );
        } else {
            strand_assert!(
                !self.is_current(),
                "scheduler {} stopped from one of its own workers",
                self.name
            );
        }

        self.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.spawn_count {
            owner.tickle();
        }
        if let Some(root) = &root {
            owner.tickle();
            if root.state() == FiberState::Init && !owner.stopping() {
                root.call();
            }
        }

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                kerror!("worker of scheduler {} panicked", self.name);
            }
        }
        self.finish_stop();
    }

    fn finish_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if self.root_thread != -1 && tls::thread_id() == self.root_thread {
            tls::set_scheduler(None);
            tls::set_sched_fiber(std::ptr::null());
        }
        kinfo!("scheduler {} stopped", self.name);
    }

    /// True when shutdown was requested and nothing is queued or running
    pub fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::SeqCst)
            && self.stopping.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == 0
            && self.queue.lock().is_empty()
    }

    /// Something sits in the queue, possibly pinned to another worker
    pub fn has_queued_work(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Shutdown has been requested (work may still be draining)
    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Queue `task`, pinned to kernel tid `thread` unless `ANY_THREAD`
    pub fn schedule(&self, task: impl Into<Task>, thread: i32) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(WorkItem { task: task.into(), thread });
            was_empty
        };
        if need_tickle {
            self.tickle_owner();
        }
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: i32) {
        self.schedule(Task::Fiber(fiber), thread);
    }

    pub fn schedule_call<F>(&self, f: F, thread: i32)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::Call(Box::new(f)), thread);
    }

    /// Queue several tasks under one lock, any thread
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(tasks.into_iter().map(|task| WorkItem { task, thread: ANY_THREAD }));
            was_empty && queue.len() > before
        };
        if need_tickle {
            self.tickle_owner();
        }
    }

    fn tickle_owner(&self) {
        if let Some(owner) = self.owner() {
            owner.tickle();
        }
    }

    /// Wake workers parked in the default idle loop
    pub fn wake_idle(&self) {
        if self.has_idle_threads() {
            let _queue = self.queue.lock();
            self.wakeup.notify_all();
        }
    }

    /// Block until work arrives, shutdown is requested or `max_wait` passes
    pub fn park(&self) {
        let mut queue = self.queue.lock();
        if queue.is_empty() && !self.stopping.load(Ordering::SeqCst) {
            self.wakeup.wait_for(&mut queue, config::global().max_wait);
        }
    }

    /// Worker loop; runs on every worker thread and on the caller's root
    /// fiber.
    fn run(&self, owner: &Arc<dyn Schedule>) {
        let tid = tls::thread_id();
        let hooks_before = tls::hook_enabled();
        tls::set_hook_enabled(owner.hooks_io());
        tls::set_scheduler(Some(self.owner.clone()));
        if tid != self.root_thread {
            let root = Fiber::current();
            tls::set_sched_fiber(Arc::as_ptr(&root));
        }
        kdebug!("scheduler {} run", self.name);

        let idle_owner = owner.clone();
        let idle = match Fiber::new(move || idle_owner.idle(), 0, false) {
            Ok(f) => f,
            Err(e) => {
                kerror!("scheduler {}: idle fiber: {}", self.name, e);
                return;
            }
        };
        let mut scratch: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut busy = false;
            let picked = {
                let mut queue = self.queue.lock();
                let mut found = None;
                let mut i = 0;
                while i < queue.len() {
                    let item = &queue[i];
                    if item.thread != ANY_THREAD && item.thread != tid {
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    if let Task::Fiber(f) = &item.task {
                        if f.state() == FiberState::Exec {
                            busy = true;
                            i += 1;
                            continue;
                        }
                    }
                    found = queue.remove(i);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                if found.is_some() && i < queue.len() {
                    tickle_me = true;
                }
                found
            };

            if tickle_me {
                owner.tickle();
            }

            match picked.map(|item| item.task) {
                Some(Task::Fiber(fiber)) => {
                    if !fiber.state().is_terminal() {
                        fiber.swap_in();
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    self.settle(fiber);
                }
                Some(Task::Call(cb)) => {
                    let fiber = match scratch.take() {
                        Some(f) => {
                            f.reset_entry(cb);
                            f
                        }
                        None => match Fiber::with_entry(cb, 0, false) {
                            Ok(f) => f,
                            Err(e) => {
                                kerror!("scheduler {}: callback fiber: {}", self.name, e);
                                self.active.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        },
                    };
                    fiber.swap_in();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    scratch = self.settle(fiber);
                }
                None => {
                    if busy {
                        // a queued fiber is still saving its context elsewhere
                        thread::yield_now();
                        continue;
                    }
                    if idle.state() == FiberState::Term {
                        kdebug!("scheduler {} idle fiber done", self.name);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle.swap_in();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                    idle.transition(FiberState::Exec, FiberState::Hold);
                }
            }
        }

        drop(scratch);
        drop(idle);
        tls::set_hook_enabled(hooks_before);
        if tid != self.root_thread {
            tls::set_scheduler(None);
            tls::set_sched_fiber(std::ptr::null());
        }
    }

    /// Post-switch bookkeeping; hands back finished fibers for reuse
    fn settle(&self, fiber: Arc<Fiber>) -> Option<Arc<Fiber>> {
        match fiber.state() {
            FiberState::Ready => {
                self.schedule_fiber(fiber, ANY_THREAD);
                None
            }
            state if state.is_terminal() => Some(fiber),
            _ => {
                fiber.transition(FiberState::Exec, FiberState::Hold);
                None
            }
        }
    }
}

impl Schedule for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.spawn_count)
            .field("use_caller", &(self.root_thread != -1))
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn run_counted(threads: usize, use_caller: bool, jobs: usize) {
        let sched = Scheduler::new(threads, use_caller, "count");
        let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..jobs).map(|_| AtomicUsize::new(0)).collect());
        sched.start().unwrap();

        for i in 0..jobs {
            let hits = hits.clone();
            sched.schedule_call(move || {
                hits[i].fetch_add(1, Ordering::SeqCst);
            }, ANY_THREAD);
        }
        sched.stop();

        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
        // every worker released its handle when it exited
        assert_eq!(Arc::strong_count(&sched), 1);
        assert!(sched.threads.lock().is_empty());
    }

    #[test]
    fn test_thousand_callbacks_four_threads() {
        run_counted(4, false, 1000);
    }

    #[test]
    fn test_thousand_callbacks_with_caller() {
        run_counted(4, true, 1000);
    }

    #[test]
    fn test_caller_only() {
        run_counted(1, true, 100);
    }

    #[test]
    fn test_affinity() {
        let sched = Scheduler::new(3, false, "pin");
        sched.start().unwrap();
        let ids = sched.thread_ids();
        assert_eq!(ids.len(), 3);

        let target = ids[1];
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..50 {
            let seen = seen.clone();
            sched.schedule_call(move || seen.lock().push(tls::thread_id()), target);
        }
        sched.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 50);
        assert!(seen.iter().all(|&t| t == target));
    }

    #[test]
    fn test_fiber_yield_to_ready() {
        let sched = Scheduler::new(2, false, "ready");
        sched.start().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let fiber = Fiber::new(move || {
            for _ in 0..3 {
                c.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
            }
            c.fetch_add(1, Ordering::SeqCst);
        }, 0, false)
        .unwrap();
        sched.schedule_fiber(fiber.clone(), ANY_THREAD);
        sched.stop();

        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_hold_and_reschedule() {
        let sched = Scheduler::new(2, false, "hold");
        sched.start().unwrap();
        let parked: Arc<Mutex<Option<Arc<Fiber>>>> = Arc::new(Mutex::new(None));
        let trace = Arc::new(Mutex::new(Vec::new()));

        let (p, t) = (parked.clone(), trace.clone());
        sched.schedule_call(move || {
            t.lock().push(1);
            *p.lock() = Some(Fiber::current());
            Fiber::yield_to_hold();
            t.lock().push(2);
        }, ANY_THREAD);

        let deadline = Instant::now() + Duration::from_secs(5);
        let fiber = loop {
            if let Some(f) = parked.lock().take() {
                break f;
            }
            assert!(Instant::now() < deadline, "fiber never parked");
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(*trace.lock(), vec![1]);

        sched.schedule_fiber(fiber, ANY_THREAD);
        sched.stop();
        assert_eq!(*trace.lock(), vec![1, 2]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let sched = Scheduler::new(1, false, "panic");
        sched.start().unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        sched.schedule_call(|| panic!("callback failure"), ANY_THREAD);
        let d = done.clone();
        sched.schedule_call(move || {
            d.fetch_add(1, Ordering::SeqCst);
        }, ANY_THREAD);
        sched.stop();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_current_inside_worker() {
        let sched = Scheduler::new(1, false, "whoami");
        sched.start().unwrap();
        let matched = Arc::new(AtomicBool::new(false));
        let (m, expected) = (matched.clone(), Arc::as_ptr(&sched) as usize);
        sched.schedule_call(move || {
            let cur = Scheduler::current().unwrap();
            let ptr = cur.scheduler() as *const Scheduler as usize;
            m.store(ptr == expected, Ordering::SeqCst);
        }, ANY_THREAD);
        sched.stop();
        assert!(matched.load(Ordering::SeqCst));
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn test_start_returns_with_workers() {
        let sched = Scheduler::new(2, false, "boot");
        let (tx, rx) = mpsc::channel();
        let s = sched.clone();
        let starter = thread::spawn(move || {
            let _ = tx.send(s.start());
        });
        let started = rx.recv_timeout(Duration::from_secs(3));
        assert_eq!(started, Ok(Ok(())), "start() did not return");
        starter.join().unwrap();
        assert_eq!(sched.thread_ids().len(), 2);
        sched.stop();
    }

    #[test]
    fn test_start_twice() {
        let sched = Scheduler::new(1, false, "twice");
        sched.start().unwrap();
        assert_eq!(sched.start(), Err(RuntimeError::AlreadyStarted));
        sched.stop();
        sched.stop();
    }
}
