//! Epoll reactor
//!
//! A [`Scheduler`] specialisation whose idle workers block in `epoll_wait`
//! instead of parking. File-descriptor readiness and timer expiry both turn
//! into work items: a fiber that registered interest is requeued, a
//! callback is scheduled as a new task.
//!
//! Interest is edge-triggered and one-shot per registration: once an event
//! fires, its slot is cleared and the fd is re-armed with whatever interest
//! remains.
//!
//! A nonblocking self-pipe sits in the epoll set so `tickle()` and timer
//! front insertions can interrupt a wait already in progress.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use nix::errno::Errno;
use parking_lot::{Mutex, RwLock};
use strand_core::constants::ANY_THREAD;
use strand_core::{Event, FiberState, RuntimeError, RuntimeResult, kdebug, kerror, kwarn, strand_assert};

use crate::config;
use crate::fiber::Fiber;
use crate::scheduler::{Callback, Schedule, Scheduler, Task};
use crate::timer::{SystemClock, Timer, TimerHook, TimerManager};
use crate::tls;

/// What a fired event resumes
enum Waiter {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

/// One registered interest
struct EventSlot {
    /// Scheduler the waiter was registered from
    scheduler: Weak<dyn Schedule>,
    waiter: Waiter,
}

#[derive(Default)]
struct FdEvents {
    events: Event,
    read: Option<EventSlot>,
    write: Option<EventSlot>,
}

impl FdEvents {
    fn slot_mut(&mut self, event: Event) -> &mut Option<EventSlot> {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Hand the waiter for `event` to its scheduler and clear the interest
    fn trigger(&mut self, fd: RawFd, event: Event) {
        strand_assert!(
            self.events.contains(event),
            "fd {} triggered for unregistered {:?}",
            fd,
            event
        );
        self.events = self.events & !event;
        let Some(slot) = self.slot_mut(event).take() else { return };
        let task = match slot.waiter {
            Waiter::Fiber(fiber) => Task::Fiber(fiber),
            Waiter::Call(cb) => Task::Call(cb),
        };
        match slot.scheduler.upgrade() {
            Some(sched) => sched.scheduler().schedule(task, ANY_THREAD),
            None => kwarn!("fd {}: {:?} waiter dropped, scheduler gone", fd, event),
        }
    }
}

/// Per-descriptor interest and waiters
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdEvents>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(Self { fd, inner: Mutex::new(FdEvents::default()) })
    }
}

fn epoll_mask(events: Event) -> u32 {
    libc::EPOLLET as u32 | events.bits()
}

pub struct Reactor {
    sched: Scheduler,
    timers: TimerManager,
    epfd: RawFd,
    /// Self-pipe: [read end, write end], both nonblocking
    tickle_fds: [RawFd; 2],
    contexts: RwLock<Vec<Arc<FdContext>>>,
    pending: AtomicUsize,
}

impl Reactor {
    /// Create and start a reactor with `threads` workers.
    ///
    /// With `use_caller` the calling thread is one of them and only runs
    /// work while [`stop`](Self::stop) drains the queue.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RuntimeResult<Arc<Reactor>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::last_os_error());
        }

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let err = RuntimeError::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event { events: epoll_mask(Event::READ), u64: fds[0] as u64 };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) } != 0 {
            let err = RuntimeError::last_os_error();
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
                libc::close(epfd);
            }
            return Err(err);
        }

        let initial = config::global().fd_table_initial;
        let reactor = Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let owner: Weak<dyn Schedule> = weak.clone();
            let hook: Weak<dyn TimerHook> = weak.clone();
            Reactor {
                sched: Scheduler::with_owner(threads, use_caller, name, owner),
                timers: TimerManager::with_clock(Arc::new(SystemClock), Some(hook)),
                epfd,
                tickle_fds: fds,
                contexts: RwLock::new((0..initial as RawFd).map(FdContext::new).collect()),
                pending: AtomicUsize::new(0),
            }
        });
        reactor.sched.start()?;
        Ok(reactor)
    }

    /// Reactor the calling thread works for
    pub fn current() -> Option<Arc<Reactor>> {
        Scheduler::current()?.into_any().downcast::<Reactor>().ok()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Registered interests not yet fired or removed
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Interest currently registered on `fd`
    pub fn interest(&self, fd: RawFd) -> Event {
        self.context(fd, false).map_or(Event::NONE, |ctx| ctx.inner.lock().events)
    }

    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<F>(
        &self,
        ms: u64,
        cb: F,
        guard: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, guard, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    pub fn stop(&self) {
        self.sched.stop();
    }

    fn context(&self, fd: RawFd, grow: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        if let Some(ctx) = self.contexts.read().get(idx) {
            return Some(ctx.clone());
        }
        if !grow {
            return None;
        }
        let mut table = self.contexts.write();
        if idx >= table.len() {
            let len = table.len();
            let new_len = (idx + 1).max(len + len / 2);
            table.extend((len..new_len).map(|i| FdContext::new(i as RawFd)));
        }
        Some(table[idx].clone())
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: Event) -> RuntimeResult<()> {
        let mut ev = libc::epoll_event { events: epoll_mask(events), u64: fd as u64 };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let err = RuntimeError::last_os_error();
            kerror!("epoll_ctl({}, op {}, fd {}, {:?}): {}", self.epfd, op, fd, events, err);
            return Err(err);
        }
        Ok(())
    }

    /// Register one-shot interest in `event` on `fd`.
    ///
    /// The waiter is `cb` if given, otherwise the running fiber, which is
    /// expected to `yield_to_hold` right after. Registering an interest
    /// that is already present aborts.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> RuntimeResult<()> {
        strand_assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes READ or WRITE, got {:?}",
            event
        );
        let ctx = self.context(fd, true).ok_or(RuntimeError::Os(libc::EBADF))?;
        let mut inner = ctx.inner.lock();
        strand_assert!(
            !inner.events.intersects(event),
            "fd {} already waits for {:?}",
            fd,
            event
        );

        let op = if inner.events.is_empty() { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        self.epoll_ctl(op, fd, inner.events | event)?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events = inner.events | event;
        let waiter = match cb {
            Some(cb) => Waiter::Call(cb),
            None => {
                let fiber = Fiber::current();
                strand_assert!(
                    fiber.state() == FiberState::Exec,
                    "fiber {} waits on fd {} while not running",
                    fiber.id(),
                    fd
                );
                Waiter::Fiber(fiber)
            }
        };
        let scheduler = tls::scheduler()
            .map(|s| Arc::downgrade(&s))
            .unwrap_or_else(|| self.sched.owner_weak());
        *inner.slot_mut(event) = Some(EventSlot { scheduler, waiter });
        Ok(())
    }

    /// Drop interest in `event` without waking its waiter
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context(fd, false) else { return false };
        let mut inner = ctx.inner.lock();
        if !inner.events.intersects(event) {
            return false;
        }
        let left = inner.events & !event;
        let op = if left.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        if self.epoll_ctl(op, fd, left).is_err() {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events = left;
        *inner.slot_mut(event) = None;
        true
    }

    /// Drop interest in `event` and fire its waiter now
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context(fd, false) else { return false };
        let mut inner = ctx.inner.lock();
        if !inner.events.intersects(event) {
            return false;
        }
        let left = inner.events & !event;
        let op = if left.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        if self.epoll_ctl(op, fd, left).is_err() {
            return false;
        }
        inner.trigger(fd, event);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Fire and clear every interest on `fd`
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.context(fd, false) else { return false };
        let mut inner = ctx.inner.lock();
        if inner.events.is_empty() {
            return false;
        }
        if self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, Event::NONE).is_err() {
            return false;
        }
        for event in [Event::READ, Event::WRITE] {
            if inner.events.contains(event) {
                inner.trigger(fd, event);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
        strand_assert!(inner.events.is_empty());
        true
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        while unsafe { libc::read(self.tickle_fds[0], buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }

    /// Dispatch one readiness notification
    fn on_ready(&self, fd: RawFd, mut bits: u32) {
        let Some(ctx) = self.context(fd, false) else { return };
        let mut inner = ctx.inner.lock();
        if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            bits |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
        }
        let ready = Event::from_bits_truncate(bits) & inner.events;
        if ready.is_empty() {
            return;
        }

        let left = inner.events & !ready;
        let op = if left.is_empty() { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        if self.epoll_ctl(op, ctx.fd, left).is_err() {
            return;
        }
        for event in [Event::READ, Event::WRITE] {
            if ready.contains(event) {
                inner.trigger(ctx.fd, event);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl Schedule for Reactor {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let n = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr().cast(), 1) };
        // a full pipe already guarantees a wakeup
        if n != 1 && Errno::last() != Errno::EAGAIN {
            kerror!("tickle write: {}", Errno::last());
        }
    }

    fn stopping(&self) -> bool {
        self.timers.next_timer() == strand_core::constants::INFINITE
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    fn idle(&self) {
        let cfg = config::global();
        let max_events = cfg.max_events;
        let max_wait = cfg.max_wait.as_millis() as u64;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; max_events];
        let mut expired = Vec::new();
        kdebug!("reactor {} idle", self.sched.name());

        loop {
            if self.stopping() {
                kdebug!("reactor {} idle exits", self.sched.name());
                // wake the next idle worker so it sees the same state
                self.tickle();
                break;
            }

            // work queued while this worker was heading here must not wait
            let timeout = if self.sched.has_queued_work() {
                0
            } else {
                self.timers.next_timer().min(max_wait) as libc::c_int
            };
            let n = loop {
                let n = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), max_events as libc::c_int, timeout)
                };
                if n < 0 && Errno::last() == Errno::EINTR {
                    continue;
                }
                break n;
            };
            if n < 0 {
                kerror!("epoll_wait({}): {}", self.epfd, Errno::last());
            }

            self.timers.list_expired_callbacks(&mut expired);
            if !expired.is_empty() {
                self.sched.schedule_batch(
                    expired.drain(..).map(|cb| Task::Call(Box::new(move || cb()))),
                );
            }

            for ev in &events[..n.max(0) as usize] {
                let (bits, fd) = (ev.events, ev.u64 as RawFd);
                if fd == self.tickle_fds[0] {
                    self.drain_tickle_pipe();
                    continue;
                }
                self.on_ready(fd, bits);
            }

            Fiber::yield_to_hold();
        }
    }

    fn hooks_io(&self) -> bool {
        true
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl TimerHook for Reactor {
    fn on_timer_inserted_at_front(&self) {
        self.tickle();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if !self.sched.is_stopped() {
            kwarn!("reactor {} dropped without stop()", self.sched.name());
        }
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("scheduler", &self.sched)
            .field("epfd", &self.epfd)
            .field("pending", &self.pending_events())
            .field("timers", &self.timers.len())
            .finish()
    }
}
