//! Hooked system calls
//!
//! Blocking-looking wrappers around libc I/O. On a thread with hooking
//! enabled (every reactor worker) a call that would block registers
//! interest with the current [`Reactor`] and suspends the calling fiber
//! instead of the OS thread. Elsewhere each wrapper is the plain libc call.
//!
//! The wrappers keep libc conventions: `-1` plus `errno` on failure, with
//! `ETIMEDOUT` when a socket timeout expires before the fd is ready.
//!
//! Only descriptors known to the [`FdTable`] are suspended on; sockets
//! created through [`socket`] and [`accept`] are entered automatically.

use std::any::Any;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use libc::{c_int, c_uint, c_void, size_t, sockaddr, socklen_t, ssize_t};
use nix::errno::Errno;
use nix::sys::ioctl::ioctl_num_type;
use nix::sys::socket::{self as nix_socket, sockopt};
use strand_core::constants::{ANY_THREAD, INFINITE};
use strand_core::{Event, RuntimeError, kdebug, kerror};

use crate::config;
use crate::fd_table::{FdTable, TimeoutKind};
use crate::fiber::Fiber;
use crate::reactor::Reactor;
use crate::timer::Timer;
use crate::tls;

/// Hooking state of the calling thread
pub fn is_enabled() -> bool {
    tls::hook_enabled()
}

/// Turn hooking on or off for the calling thread
pub fn set_enabled(on: bool) {
    tls::set_hook_enabled(on);
}

/// Shared between a waiting call and its timeout timer
#[derive(Default)]
struct TimerInfo {
    timed_out: AtomicBool,
}

enum Wait {
    Ready,
    TimedOut,
    NoReactor,
    Failed(c_int),
}

fn arm_timeout(reactor: &Arc<Reactor>, info: &Arc<TimerInfo>, fd: RawFd, event: Event, ms: u64) -> Arc<Timer> {
    let weak_info: Weak<TimerInfo> = Arc::downgrade(info);
    let guard: Weak<dyn Any + Send + Sync> = weak_info.clone();
    let weak_reactor = Arc::downgrade(reactor);
    reactor.add_condition_timer(
        ms,
        move || {
            let Some(info) = weak_info.upgrade() else { return };
            if info.timed_out.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(reactor) = weak_reactor.upgrade() {
                reactor.cancel_event(fd, event);
            }
        },
        guard,
        false,
    )
}

/// Suspend the running fiber until `fd` is ready for `event` or `timeout_ms`
/// passes.
fn wait_ready(fd: RawFd, event: Event, timeout_ms: u64, name: &str) -> Wait {
    let Some(reactor) = Reactor::current() else { return Wait::NoReactor };
    if let Err(e) = reactor.add_event(fd, event, None) {
        kerror!("{}: add_event({}, {:?}): {}", name, fd, event, e);
        let code = match e {
            RuntimeError::Os(code) => code,
            _ => libc::EIO,
        };
        return Wait::Failed(code);
    }
    // armed only once the event is registered, so an early expiry still
    // finds something to cancel
    let info = Arc::new(TimerInfo::default());
    let timer = (timeout_ms != INFINITE).then(|| arm_timeout(&reactor, &info, fd, event, timeout_ms));
    // a parked fiber must not keep the reactor alive
    drop(reactor);
    Fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }
    if info.timed_out.load(Ordering::SeqCst) {
        Wait::TimedOut
    } else {
        Wait::Ready
    }
}

/// Run `op` until it stops returning `EAGAIN`, suspending in between.
fn do_io<F>(fd: RawFd, name: &str, event: Event, kind: TimeoutKind, mut op: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !is_enabled() {
        return op();
    }
    let Some(ctx) = FdTable::global().get(fd, false) else { return op() };
    if ctx.is_closed() {
        Errno::set_raw(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return op();
    }
    let timeout = ctx.timeout(kind);

    loop {
        let mut n = op();
        while n == -1 && Errno::last() == Errno::EINTR {
            n = op();
        }
        if n != -1 || Errno::last() != Errno::EAGAIN {
            return n;
        }

        match wait_ready(fd, event, timeout, name) {
            Wait::Ready if ctx.is_closed() => {
                Errno::set_raw(libc::EBADF);
                return -1;
            }
            Wait::Ready => continue,
            Wait::TimedOut => {
                kdebug!("{}: fd {} timed out after {} ms", name, fd, timeout);
                Errno::set_raw(libc::ETIMEDOUT);
                return -1;
            }
            Wait::NoReactor => {
                Errno::set_raw(libc::EAGAIN);
                return -1;
            }
            Wait::Failed(code) => {
                Errno::set_raw(code);
                return -1;
            }
        }
    }
}

/// Park the running fiber for `ms`; false when no reactor is current
fn suspend_for(ms: u64) -> bool {
    let Some(reactor) = Reactor::current() else { return false };
    let fiber = Fiber::current();
    let weak = Arc::downgrade(&reactor);
    reactor.add_timer(
        ms,
        move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.scheduler().schedule_fiber(fiber.clone(), ANY_THREAD);
            }
        },
        false,
    );
    drop(reactor);
    Fiber::yield_to_hold();
    true
}

pub fn sleep(secs: c_uint) -> c_uint {
    if is_enabled() && suspend_for(u64::from(secs) * 1000) {
        return 0;
    }
    unsafe { libc::sleep(secs) }
}

pub fn usleep(usecs: c_uint) -> c_int {
    if is_enabled() && suspend_for(usecs as u64 / 1000) {
        return 0;
    }
    unsafe { libc::usleep(usecs) }
}

/// `secs * 1000 + ms`, saturating; negative parts count as zero
fn whole_ms(secs: libc::time_t, ms: i64) -> u64 {
    let secs = u64::try_from(secs).unwrap_or(0);
    let ms = u64::try_from(ms).unwrap_or(0);
    secs.saturating_mul(1000).saturating_add(ms)
}

/// Sub-millisecond parts are dropped when suspending; `rem` is never
/// written on that path.
pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> c_int {
    if is_enabled() {
        let ms = whole_ms(req.tv_sec, req.tv_nsec as i64 / 1_000_000);
        if suspend_for(ms) {
            return 0;
        }
    }
    let rem = rem.map_or(std::ptr::null_mut(), |r| r as *mut libc::timespec);
    unsafe { libc::nanosleep(req, rem) }
}

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && is_enabled() {
        FdTable::global().get(fd, true);
    }
    fd
}

/// `connect` bounded by `timeout_ms` (`INFINITE` waits forever).
///
/// # Safety
///
/// `addr` must point at a valid socket address of `len` bytes.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const sockaddr,
    len: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_enabled() {
        return libc::connect(fd, addr, len);
    }
    let Some(ctx) = FdTable::global().get(fd, false) else {
        return libc::connect(fd, addr, len);
    };
    if ctx.is_closed() {
        Errno::set_raw(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, len);
    }

    let n = libc::connect(fd, addr, len);
    if n == 0 {
        return 0;
    }
    if n != -1 || Errno::last() != Errno::EINPROGRESS {
        return n;
    }

    match wait_ready(fd, Event::WRITE, timeout_ms, "connect") {
        Wait::Ready => {}
        Wait::TimedOut => {
            Errno::set_raw(libc::ETIMEDOUT);
            return -1;
        }
        Wait::NoReactor => {
            Errno::set_raw(libc::EINPROGRESS);
            return -1;
        }
        // fall through: the pending socket error is the better answer
        Wait::Failed(_) => {}
    }

    let sock = std::os::fd::BorrowedFd::borrow_raw(fd);
    match nix_socket::getsockopt(&sock, sockopt::SocketError) {
        Ok(0) => 0,
        Ok(err) => {
            Errno::set_raw(err);
            -1
        }
        Err(errno) => {
            Errno::set_raw(errno as c_int);
            -1
        }
    }
}

/// `connect` bounded by the configured connect timeout.
///
/// # Safety
///
/// `addr` must point at a valid socket address of `len` bytes.
pub unsafe fn connect(fd: RawFd, addr: *const sockaddr, len: socklen_t) -> c_int {
    let timeout = config::global().connect_timeout.as_millis() as u64;
    connect_with_timeout(fd, addr, len, timeout)
}

/// # Safety
///
/// `addr` and `len` must be null or point at writable storage, as for
/// `accept(2)`.
pub unsafe fn accept(fd: RawFd, addr: *mut sockaddr, len: *mut socklen_t) -> RawFd {
    let n = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || {
        libc::accept(fd, addr, len) as ssize_t
    }) as RawFd;
    if n >= 0 && is_enabled() {
        FdTable::global().get(n, true);
    }
    n
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> ssize_t {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
    })
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> ssize_t {
    let cnt = bufs.len().min(c_int::MAX as usize) as c_int;
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, bufs.as_mut_ptr() as *const libc::iovec, cnt)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
    })
}

/// # Safety
///
/// `addr` and `len` follow `recvfrom(2)`: null or valid writable storage.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: c_int,
    addr: *mut sockaddr,
    len: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        libc::recvfrom(fd, buf.as_mut_ptr().cast(), buf.len(), flags, addr, len)
    })
}

/// # Safety
///
/// `msg` must point at a valid `msghdr` whose buffers stay live for the call.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || libc::recvmsg(fd, msg, flags))
}

pub fn write(fd: RawFd, buf: &[u8]) -> ssize_t {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len())
    })
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> ssize_t {
    let cnt = bufs.len().min(c_int::MAX as usize) as c_int;
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, bufs.as_ptr() as *const libc::iovec, cnt)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr().cast(), buf.len(), flags)
    })
}

/// # Safety
///
/// `addr` must point at a valid socket address of `len` bytes.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: c_int,
    addr: *const sockaddr,
    len: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || {
        libc::sendto(fd, buf.as_ptr().cast(), buf.len() as size_t, flags, addr, len)
    })
}

/// # Safety
///
/// `msg` must point at a valid `msghdr` whose buffers stay live for the call.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || libc::sendmsg(fd, msg, flags))
}

/// Wake every fiber waiting on `fd`, forget it, then close it
pub fn close(fd: RawFd) -> c_int {
    if is_enabled() && FdTable::global().get(fd, false).is_some() {
        if let Some(reactor) = Reactor::current() {
            reactor.cancel_all(fd);
        }
        FdTable::global().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl` with an integer argument.
///
/// For tracked sockets `F_SETFL` records the caller's `O_NONBLOCK` wish while
/// the fd itself stays non-blocking, and `F_GETFL` reports that wish back.
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> c_int {
    let tracked = FdTable::global()
        .get(fd, false)
        .filter(|ctx| !ctx.is_closed() && ctx.is_socket());

    match (cmd, tracked) {
        (libc::F_SETFL, Some(ctx)) => {
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let arg = if ctx.sys_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        (libc::F_GETFL, Some(ctx)) => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags == -1 {
                return flags;
            }
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl`; `FIONBIO` on a tracked socket only records the caller's wish.
///
/// # Safety
///
/// `arg` must be valid for `request`, as for `ioctl(2)`.
pub unsafe fn ioctl(fd: RawFd, request: ioctl_num_type, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as ioctl_num_type && !arg.is_null() {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = FdTable::global().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
                return 0;
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
///
/// As for `getsockopt(2)`.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    libc::getsockopt(fd, level, name, value, len)
}

/// `setsockopt`; receive/send timeouts are also recorded for hooked calls.
///
/// # Safety
///
/// As for `setsockopt(2)`.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
        && !value.is_null()
        && len as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = FdTable::global().get(fd, false) {
            let tv = &*(value as *const libc::timeval);
            let ms = whole_ms(tv.tv_sec, tv.tv_usec as i64 / 1000);
            let kind = if name == libc::SO_RCVTIMEO { TimeoutKind::Recv } else { TimeoutKind::Send };
            ctx.set_timeout(kind, if ms == 0 { INFINITE } else { ms });
        }
    }
    libc::setsockopt(fd, level, name, value, len)
}

/// Set `SO_RCVTIMEO` / `SO_SNDTIMEO`; `None` clears it
pub fn set_socket_timeout(fd: RawFd, kind: TimeoutKind, timeout: Option<std::time::Duration>) -> c_int {
    let tv = match timeout {
        Some(d) => libc::timeval {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        },
        None => libc::timeval { tv_sec: 0, tv_usec: 0 },
    };
    let name = match kind {
        TimeoutKind::Recv => libc::SO_RCVTIMEO,
        TimeoutKind::Send => libc::SO_SNDTIMEO,
    };
    unsafe {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            (&tv as *const libc::timeval).cast(),
            std::mem::size_of::<libc::timeval>() as socklen_t,
        )
    }
}
