//! Descriptor table for hooked I/O
//!
//! Records what the hook layer must know about each fd: whether it is a
//! socket, whether the runtime forced `O_NONBLOCK` on it or the application
//! asked for it, and the per-direction timeouts set through `setsockopt`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::fstat;
use parking_lot::RwLock;
use strand_core::constants::INFINITE;
use strand_core::kdebug;

use crate::config;

/// Which socket timeout a hooked call honours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`
    Recv,
    /// `SO_SNDTIMEO`
    Send,
}

pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: bool,
    user_nonblock: AtomicBool,
    is_closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    /// Inspect `fd`; sockets are switched to `O_NONBLOCK` on the spot
    fn new(fd: RawFd) -> Self {
        let (is_init, is_socket) = match fstat(fd) {
            Ok(st) => (true, st.st_mode & libc::S_IFMT == libc::S_IFSOCK),
            Err(_) => (false, false),
        };

        let mut sys_nonblock = false;
        if is_socket {
            if let Ok(bits) = fcntl(fd, FcntlArg::F_GETFL) {
                let flags = OFlag::from_bits_truncate(bits);
                if flags.contains(OFlag::O_NONBLOCK)
                    || fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).is_ok()
                {
                    sys_nonblock = true;
                }
            }
        }

        Self {
            fd,
            is_init,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(INFINITE),
            send_timeout: AtomicU64::new(INFINITE),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `fstat` succeeded when the entry was created
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// The runtime put the fd in `O_NONBLOCK` mode
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    /// The application asked for non-blocking semantics
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    /// Timeout in ms, `INFINITE` when unset
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout.store(ms, Ordering::Release),
        }
    }
}

impl std::fmt::Debug for FdCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdCtx")
            .field("fd", &self.fd)
            .field("socket", &self.is_socket)
            .field("sys_nonblock", &self.sys_nonblock)
            .field("user_nonblock", &self.user_nonblock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Fd-indexed table of [`FdCtx`] entries
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static FD_TABLE: OnceLock<FdTable> = OnceLock::new();

impl FdTable {
    pub fn new(initial: usize) -> Self {
        Self { slots: RwLock::new(vec![None; initial]) }
    }

    /// Process-wide table used by the hook layer
    pub fn global() -> &'static FdTable {
        FD_TABLE.get_or_init(|| FdTable::new(config::global().fd_table_initial))
    }

    /// Entry for `fd`, created (and the table grown) when `auto_create`
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read();
            match slots.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let len = slots.len();
            slots.resize((idx + 1).max(len + len / 2), None);
        }
        let ctx = slots[idx].get_or_insert_with(|| {
            kdebug!("fd table: new entry for fd {}", fd);
            Arc::new(FdCtx::new(fd))
        });
        Some(ctx.clone())
    }

    /// Forget `fd`; holders of its entry see it as closed
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.set_closed();
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let table = FdTable::new(4);
        let (a, b) = socketpair();
        assert!(table.get(a, false).is_none());

        let ctx = table.get(a, true).unwrap();
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        let flags = unsafe { libc::fcntl(a, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        assert!(Arc::ptr_eq(&ctx, &table.get(a, false).unwrap()));
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_pipe_left_alone() {
        let table = FdTable::new(4);
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let ctx = table.get(fds[0], true).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        assert_eq!(unsafe { libc::fcntl(fds[0], libc::F_GETFL) } & libc::O_NONBLOCK, 0);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_timeouts_and_delete() {
        let table = FdTable::new(2);
        let (a, b) = socketpair();
        let ctx = table.get(a, true).unwrap();
        assert!(table.capacity() > a as usize);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), INFINITE);
        assert_eq!(ctx.timeout(TimeoutKind::Send), INFINITE);

        ctx.set_timeout(TimeoutKind::Recv, 100);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 100);
        assert_eq!(ctx.timeout(TimeoutKind::Send), INFINITE);

        table.del(a);
        assert!(ctx.is_closed());
        assert!(table.get(a, false).is_none());
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_bad_fd() {
        let table = FdTable::new(2);
        assert!(table.get(-1, true).is_none());
        let ctx = table.get(1000, true).unwrap();
        assert!(!ctx.is_init());
        assert!(table.capacity() >= 1001);
    }
}
