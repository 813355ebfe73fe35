//! Syscall interposition
//!
//! This module defines the blocking POSIX I/O surface (`read`, `write`,
//! `connect`, `accept`, `sleep`, ...) as exported `extern "C"` symbols that
//! shadow libc at link time (or via `LD_PRELOAD` when built as a cdylib).
//! With hooks disabled, or for descriptors the runtime does not manage,
//! every call forwards verbatim to the real implementation resolved once
//! through `dlsym(RTLD_NEXT)`.
//!
//! With hooks enabled on a thread, a call that would block on a managed
//! socket instead registers interest with the current
//! [IoScheduler](../coio/struct.IoScheduler.html), optionally arms a
//! timeout, and yields the calling fiber. The fiber is resumed on readiness
//! (retrying the real call), or on timeout (failing with `ETIMEDOUT`).
//! errno is reported exactly as libc would: the runtime never swallows it.
use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use libc::{c_char, c_int, c_long, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};

use crate::coio::{self, Event};
use crate::fd::{FdTable, TimeoutKind};
use crate::fiber::{self, Fiber};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Default timeout for hooked `connect`, in milliseconds.
static CONNECT_TIMEOUT_MS: AtomicI64 = AtomicI64::new(3000);

/// Whether blocking calls on this thread are rerouted through the runtime.
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|f| f.get())
}

/// Enable or disable interception for the current thread. I/O scheduler
/// workers enable it themselves when they start.
pub fn set_hook_enabled(flag: bool) {
    HOOK_ENABLED.with(|f| f.set(flag));
}

/// Change the default hooked `connect` timeout (ms, -1 disables it).
/// Meant to be called once at startup.
pub fn set_connect_timeout(ms: i64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::SeqCst);
}

/// The real libc entry points, resolved once on first use.
pub(crate) struct RealFns {
    pub(crate) sleep: unsafe extern "C" fn(c_uint) -> c_uint,
    pub(crate) socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    pub(crate) connect: unsafe extern "C" fn(c_int, *const libc::sockaddr, socklen_t) -> c_int,
    pub(crate) accept: unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut socklen_t) -> c_int,
    pub(crate) accept4:
        unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut socklen_t, c_int) -> c_int,
    pub(crate) read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t,
    pub(crate) readv: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t,
    pub(crate) recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t,
    pub(crate) recvfrom: unsafe extern "C" fn(
        c_int,
        *mut c_void,
        size_t,
        c_int,
        *mut libc::sockaddr,
        *mut socklen_t,
    ) -> ssize_t,
    pub(crate) recvmsg: unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> ssize_t,
    pub(crate) write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t,
    pub(crate) writev: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> ssize_t,
    pub(crate) send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
    pub(crate) sendto: unsafe extern "C" fn(
        c_int,
        *const c_void,
        size_t,
        c_int,
        *const libc::sockaddr,
        socklen_t,
    ) -> ssize_t,
    pub(crate) sendmsg: unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> ssize_t,
    pub(crate) close: unsafe extern "C" fn(c_int) -> c_int,
    pub(crate) fcntl: unsafe extern "C" fn(c_int, c_int, c_long) -> c_int,
    pub(crate) ioctl: unsafe extern "C" fn(c_int, c_ulong, *mut c_void) -> c_int,
    pub(crate) getsockopt:
        unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int,
    pub(crate) setsockopt:
        unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int,
}

// Function pointers are pointer sized; transmute_copy is how a dlsym result
// becomes a typed entry point.
unsafe fn resolve<T: Copy>(name: &'static [u8]) -> T {
    assert_eq!(mem::size_of::<T>(), mem::size_of::<*mut c_void>());
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char);
    assert!(
        !sym.is_null(),
        "dlsym(RTLD_NEXT) failed for {}",
        String::from_utf8_lossy(&name[..name.len() - 1])
    );
    mem::transmute_copy(&sym)
}

lazy_static! {
    static ref REAL: RealFns = unsafe {
        RealFns {
            sleep: resolve(b"sleep\0"),
            socket: resolve(b"socket\0"),
            connect: resolve(b"connect\0"),
            accept: resolve(b"accept\0"),
            accept4: resolve(b"accept4\0"),
            read: resolve(b"read\0"),
            readv: resolve(b"readv\0"),
            recv: resolve(b"recv\0"),
            recvfrom: resolve(b"recvfrom\0"),
            recvmsg: resolve(b"recvmsg\0"),
            write: resolve(b"write\0"),
            writev: resolve(b"writev\0"),
            send: resolve(b"send\0"),
            sendto: resolve(b"sendto\0"),
            sendmsg: resolve(b"sendmsg\0"),
            close: resolve(b"close\0"),
            fcntl: resolve(b"fcntl\0"),
            ioctl: resolve(b"ioctl\0"),
            getsockopt: resolve(b"getsockopt\0"),
            setsockopt: resolve(b"setsockopt\0"),
        }
    };
}

pub(crate) fn real() -> &'static RealFns {
    &REAL
}

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn set_errno(v: c_int) {
    unsafe { *libc::__errno_location() = v };
}

/// Shared between a parked fiber and its timeout timer. The timer only
/// holds a weak witness, so a fiber that already returned cannot be touched
/// by a stale timeout.
struct TimerInfo {
    cancelled: AtomicI32,
}

/// The common reroute policy for the data-path syscalls.
///
/// Retries the real call over EINTR; on EAGAIN registers `ev` interest with
/// the current I/O scheduler (the calling fiber is the continuation), arms
/// the fd's configured timeout if any, yields, and either retries on
/// readiness or fails with the timeout's errno.
fn do_io<F>(fd: c_int, real_call: F, name: &str, ev: Event, kind: TimeoutKind) -> ssize_t
where
    F: Fn() -> ssize_t,
{
    if !is_hook_enabled() {
        return real_call();
    }
    let ctx = match FdTable::instance().get(fd, false) {
        Some(ctx) => ctx,
        None => return real_call(),
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return real_call();
    }

    let timeout_ms = ctx.timeout(kind);
    let tinfo = Arc::new(TimerInfo {
        cancelled: AtomicI32::new(0),
    });

    loop {
        let mut n = real_call();
        while n == -1 && errno() == libc::EINTR {
            n = real_call();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Would block: park on the reactor until readiness or timeout.
        let io = match coio::current_io() {
            Some(io) => io,
            // No reactor on this thread; the kernel-side EAGAIN stands.
            None => return n,
        };

        let timer = if timeout_ms != -1 {
            let winfo = Arc::downgrade(&tinfo);
            let wio = Arc::downgrade(&io);
            let cond = winfo.clone();
            Some(io.timers().add_condition_timer(
                timeout_ms as u64,
                move || {
                    let tinfo = match winfo.upgrade() {
                        Some(t) => t,
                        None => return,
                    };
                    if tinfo.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    tinfo.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    if let Some(io) = wio.upgrade() {
                        io.cancel_event(fd, ev);
                    }
                },
                cond,
                false,
            ))
        } else {
            None
        };

        if let Err(err) = io.add_event(fd, ev, None) {
            log::error!("{}: registering {:?} on fd {} failed", name, ev, fd);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            if let Some(e) = err.os_error() {
                set_errno(e);
            }
            return -1;
        }

        fiber::fiber_yield();
        // Resumed: either the fd is ready or the timeout cancelled us.
        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
    }
}

/// Hooked `connect` body with an explicit timeout (ms, -1 for none).
pub fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: i64,
) -> c_int {
    if !is_hook_enabled() {
        return unsafe { (real().connect)(fd, addr, addrlen) };
    }
    let ctx = match FdTable::instance().get(fd, false) {
        Some(ctx) => ctx,
        None => {
            set_errno(libc::EBADF);
            return -1;
        }
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { (real().connect)(fd, addr, addrlen) };
    }

    let n = unsafe { (real().connect)(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // In progress on a runtime-nonblocked socket: wait for writability.
    let io = match coio::current_io() {
        Some(io) => io,
        None => return n,
    };
    let tinfo = Arc::new(TimerInfo {
        cancelled: AtomicI32::new(0),
    });
    let timer = if timeout_ms != -1 {
        let winfo = Arc::downgrade(&tinfo);
        let wio = Arc::downgrade(&io);
        let cond = winfo.clone();
        Some(io.timers().add_condition_timer(
            timeout_ms as u64,
            move || {
                let tinfo = match winfo.upgrade() {
                    Some(t) => t,
                    None => return,
                };
                if tinfo.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                tinfo.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                if let Some(io) = wio.upgrade() {
                    io.cancel_event(fd, Event::WRITE);
                }
            },
            cond,
            false,
        ))
    } else {
        None
    };

    match io.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            fiber::fiber_yield();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(_) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
        }
    }

    // The connection attempt finished one way or the other; ask the socket.
    let mut error: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    if unsafe {
        (real().getsockopt)(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut c_int as *mut c_void,
            &mut len,
        )
    } == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

#[no_mangle]
pub extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if !is_hook_enabled() {
        return unsafe { (real().sleep)(seconds) };
    }
    let io = match coio::current_io() {
        Some(io) => io,
        None => return unsafe { (real().sleep)(seconds) },
    };
    let fiber = Fiber::current();
    let wio = Arc::downgrade(&io);
    io.timers().add_timer(
        seconds as u64 * 1000,
        move || {
            if let Some(io) = wio.upgrade() {
                io.schedule_fiber(fiber.clone());
            }
        },
        false,
    );
    fiber::fiber_yield();
    0
}

#[no_mangle]
pub extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { (real().socket)(domain, ty, protocol) };
    if !is_hook_enabled() || fd == -1 {
        return fd;
    }
    FdTable::instance().get(fd, true);
    fd
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::SeqCst))
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    s: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let fd = do_io(
        s,
        || unsafe { (real().accept)(s, addr, addrlen) as ssize_t },
        "accept",
        Event::READ,
        TimeoutKind::Recv,
    ) as c_int;
    if fd >= 0 && is_hook_enabled() {
        FdTable::instance().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn accept4(
    s: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
    flags: c_int,
) -> c_int {
    let fd = do_io(
        s,
        || unsafe { (real().accept4)(s, addr, addrlen, flags) as ssize_t },
        "accept4",
        Event::READ,
        TimeoutKind::Recv,
    ) as c_int;
    if fd >= 0 && is_hook_enabled() {
        FdTable::instance().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(
        fd,
        || unsafe { (real().read)(fd, buf, count) },
        "read",
        Event::READ,
        TimeoutKind::Recv,
    )
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(
        fd,
        || unsafe { (real().readv)(fd, iov, iovcnt) },
        "readv",
        Event::READ,
        TimeoutKind::Recv,
    )
}

#[no_mangle]
pub unsafe extern "C" fn recv(sockfd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { (real().recv)(sockfd, buf, len, flags) },
        "recv",
        Event::READ,
        TimeoutKind::Recv,
    )
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { (real().recvfrom)(sockfd, buf, len, flags, src_addr, addrlen) },
        "recvfrom",
        Event::READ,
        TimeoutKind::Recv,
    )
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(sockfd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        sockfd,
        || unsafe { (real().recvmsg)(sockfd, msg, flags) },
        "recvmsg",
        Event::READ,
        TimeoutKind::Recv,
    )
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(
        fd,
        || unsafe { (real().write)(fd, buf, count) },
        "write",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(
        fd,
        || unsafe { (real().writev)(fd, iov, iovcnt) },
        "writev",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

#[no_mangle]
pub unsafe extern "C" fn send(s: c_int, msg: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(
        s,
        || unsafe { (real().send)(s, msg, len, flags) },
        "send",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    s: c_int,
    msg: *const c_void,
    len: size_t,
    flags: c_int,
    to: *const libc::sockaddr,
    tolen: socklen_t,
) -> ssize_t {
    do_io(
        s,
        || unsafe { (real().sendto)(s, msg, len, flags, to, tolen) },
        "sendto",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(s: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(
        s,
        || unsafe { (real().sendmsg)(s, msg, flags) },
        "sendmsg",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

#[no_mangle]
pub extern "C" fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return unsafe { (real().close)(fd) };
    }
    if let Some(ctx) = FdTable::instance().get(fd, false) {
        ctx.set_closed(true);
        // Wake every fiber parked on this fd before the kernel forgets it.
        if let Some(io) = coio::current_io() {
            io.cancel_all(fd);
        }
        FdTable::instance().del(fd);
    }
    unsafe { (real().close)(fd) }
}

// fcntl and ioctl are C-variadic; stable Rust cannot define variadics, so
// the optional argument is taken as one register-sized value and forwarded
// verbatim for every command we do not interpret. On the x86_64 SysV ABI
// the call frames are identical.
#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let ctx = match FdTable::instance().get(fd, false) {
                Some(ctx) => ctx,
                None => return (real().fcntl)(fd, cmd, arg),
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return (real().fcntl)(fd, cmd, arg);
            }
            // Remember what the user wanted, then overlay the runtime's own
            // nonblock requirement before the kernel sees it.
            let mut flags = arg as c_int;
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            (real().fcntl)(fd, cmd, flags as c_long)
        }
        libc::F_GETFL => {
            let flags = (real().fcntl)(fd, cmd, 0);
            let ctx = match FdTable::instance().get(fd, false) {
                Some(ctx) => ctx,
                None => return flags,
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return flags;
            }
            // Report the user's view, not the kernel's.
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => (real().fcntl)(fd, cmd, arg),
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(d: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = !arg.is_null() && *(arg as *const c_int) != 0;
        if let Some(ctx) = FdTable::instance().get(d, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    (real().ioctl)(d, request, arg)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    (real().getsockopt)(sockfd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
    {
        if let Some(ctx) = FdTable::instance().get(sockfd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as i64 * 1000 + tv.tv_usec as i64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            // A zero timeval means "no timeout" to the kernel; keep that
            // meaning instead of arming an instantly expiring timer.
            ctx.set_timeout(kind, if ms == 0 { -1 } else { ms });
        }
    }
    (real().setsockopt)(sockfd, level, optname, optval, optlen)
}
