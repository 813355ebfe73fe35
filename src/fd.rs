//! File descriptor table
//!
//! Process-wide metadata about the descriptors the hook layer has seen:
//! whether the fd is a socket, whether the *user* asked for O_NONBLOCK (as
//! opposed to the runtime, which silently nonblocks every socket), and the
//! per-direction timeouts configured through `setsockopt`.
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use crate::hook;

/// Which of the two stored timeouts applies to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Per-descriptor context.
///
/// For sockets the kernel O_NONBLOCK flag is forced on at construction and
/// `sys_nonblock` records that; `user_nonblock` tracks only what the user
/// explicitly requested, so `fcntl(F_GETFL)` can keep up the illusion that
/// nobody touched the flag.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut st: libc::stat = unsafe { mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let ctx = FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(-1),
            send_timeout_ms: AtomicI64::new(-1),
        };
        if is_socket {
            let flags = unsafe { (hook::real().fcntl)(fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe {
                    (hook::real().fcntl)(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long)
                };
            }
            ctx.sys_nonblock.store(true, Ordering::Relaxed);
        }
        ctx
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn set_closed(&self, flag: bool) {
        self.closed.store(flag, Ordering::Relaxed);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, flag: bool) {
        self.user_nonblock.store(flag, Ordering::Relaxed);
    }

    /// Stored timeout in milliseconds, -1 when unset.
    pub fn timeout(&self, kind: TimeoutKind) -> i64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: i64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

/// Process-wide fd → [FdCtx](struct.FdCtx.html) map, a sparse vector grown
/// by half on demand.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

lazy_static! {
    static ref FD_TABLE: FdTable = FdTable {
        slots: RwLock::new(vec![None; 64]),
    };
}

impl FdTable {
    /// The lazily initialized process-wide instance.
    pub fn instance() -> &'static FdTable {
        &FD_TABLE
    }

    /// Fetch the context for `fd`; with `auto_create` a missing entry is
    /// constructed (and classified) on the spot.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            match slots.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let grown = slots.len().max(idx + idx / 2 + 1);
            slots.resize(grown, None);
        }
        if let Some(ctx) = &slots[idx] {
            // Another thread created it between the locks.
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        slots[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget `fd`. Subsequent lookups return `None` until it is re-created.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_is_not_a_socket() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = FdTable::instance().get(fds[0], true).unwrap();
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        FdTable::instance().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn socket_is_classified_and_nonblocked() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = FdTable::instance().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        FdTable::instance().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        // The table only needs a valid fd to classify; a large index is
        // simulated by duplicating high.
        let high = unsafe { libc::fcntl(fds[0], libc::F_DUPFD, 200) };
        assert!(high >= 200, "F_DUPFD failed");
        assert!(FdTable::instance().get(high, false).is_none());
        let ctx = FdTable::instance().get(high, true).unwrap();
        assert_eq!(ctx.fd(), high);
        assert!(FdTable::instance().get(high, false).is_some());
        FdTable::instance().del(high);
        assert!(FdTable::instance().get(high, false).is_none());
        unsafe {
            libc::close(high);
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn timeouts_default_unset() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = FdTable::instance().get(fds[0], true).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), -1);
        assert_eq!(ctx.timeout(TimeoutKind::Send), -1);
        ctx.set_timeout(TimeoutKind::Recv, 250);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout(TimeoutKind::Send), -1);
        FdTable::instance().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
