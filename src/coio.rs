//! Cooperative input/output scheduler
//!
//! [IoScheduler](struct.IoScheduler.html) extends the plain
//! [Scheduler](../scheduler/struct.Scheduler.html) with an epoll instance, a
//! self-pipe for waking idle workers, a per-fd event table and a
//! [TimerSet](../timer/struct.TimerSet.html). Its idle fiber parks in
//! `epoll_wait` instead of spinning, bounded by the soonest timer deadline.
//!
//! Events are **one-shot**: registering `READ` or `WRITE` interest on an fd
//! stores a continuation (an explicit callback, or the registering fiber
//! itself) that is scheduled exactly once when the event fires, times out or
//! is cancelled. Re-arming is always the consumer's responsibility.
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::error::Error;
use crate::fiber::{self, Fiber, FiberFn, FiberRef, State};
use crate::hook;
use crate::scheduler::{self, Scheduler, SchedulerCore, SchedulerExt, Task, Work};
use crate::timer::{Timer, TimerSet};

/// Events drained per `epoll_wait` pass; the rest are picked up next round.
const MAX_EVENTS: usize = 256;
/// Upper bound on how long an idle worker sleeps, even with no timer due.
const MAX_TIMEOUT_MS: u64 = 5000;

bitflags! {
    /// I/O interest, numerically identical to the epoll event bits.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

thread_local! {
    static CURRENT_IO: RefCell<Option<Weak<IoCore>>> = RefCell::new(None);
}

/// The I/O core driving the current worker thread, if any. This is what the
/// hook layer reroutes blocking calls through.
pub(crate) fn current_io() -> Option<Arc<IoCore>> {
    CURRENT_IO.with(|c| c.borrow().as_ref().and_then(|w| w.upgrade()))
}

/// Continuation attached to one registered event. Exactly one of
/// `fiber`/`cb` is set while registered; both are empty otherwise.
struct EventContext {
    scheduler: Option<Arc<SchedulerCore>>,
    fiber: Option<FiberRef>,
    cb: Option<FiberFn>,
}

impl EventContext {
    fn new() -> EventContext {
        EventContext {
            scheduler: None,
            fiber: None,
            cb: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }

    fn reset(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

struct FdEvents {
    /// Currently registered interest.
    events: Event,
    read: EventContext,
    write: EventContext,
}

impl FdEvents {
    fn context_mut(&mut self, ev: Event) -> &mut EventContext {
        match ev {
            Event::READ => &mut self.read,
            Event::WRITE => &mut self.write,
            _ => unreachable!("context_mut: exactly one event expected"),
        }
    }
}

/// Per-fd event state. The raw pointer to this struct rides in the epoll
/// user data; the owning vector never drops entries, so it stays valid for
/// the life of the scheduler.
struct FdContext {
    fd: RawFd,
    state: Mutex<FdEvents>,
}

/// Clear `ev` from the registered set and hand its continuation to the
/// dispatcher recorded at registration time. One-shot by construction.
fn trigger_event(fd: RawFd, st: &mut FdEvents, ev: Event) {
    assert!(
        st.events.contains(ev),
        "triggering unregistered event {:?} on fd {}",
        ev,
        fd
    );
    st.events.remove(ev);
    let ctx = st.context_mut(ev);
    let scheduler = ctx.scheduler.take();
    let work = match ctx.cb.take() {
        Some(cb) => Work::Call(cb),
        None => Work::Fiber(
            ctx.fiber
                .take()
                .expect("registered event has neither fiber nor callback"),
        ),
    };
    ctx.reset();
    match scheduler {
        Some(s) => s.push_task(Task { work, thread: None }),
        None => log::error!("event {:?} on fd {} has no dispatcher", ev, fd),
    }
}

pub(crate) struct IoCore {
    epfd: RawFd,
    /// Self-pipe; `[0]` is the nonblocking read end registered with epoll.
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
    timers: TimerSet,
    sched: Weak<SchedulerCore>,
}

impl IoCore {
    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let slots = self.fd_contexts.read().unwrap();
            if let Some(Some(ctx)) = slots.get(idx) {
                return ctx.clone();
            }
        }
        let mut slots = self.fd_contexts.write().unwrap();
        if idx >= slots.len() {
            let grown = slots.len().max(idx + idx / 2 + 1);
            slots.resize(grown, None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdContext {
                fd,
                state: Mutex::new(FdEvents {
                    events: Event::empty(),
                    read: EventContext::new(),
                    write: EventContext::new(),
                }),
            }));
        }
        slots[idx].as_ref().unwrap().clone()
    }

    fn existing_fd_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let slots = self.fd_contexts.read().unwrap();
        match slots.get(fd as usize) {
            Some(Some(ctx)) => Some(ctx.clone()),
            _ => None,
        }
    }

    /// Register one-shot interest in `ev` on `fd`.
    ///
    /// Without an explicit callback the *current fiber* becomes the
    /// continuation, so the caller must be a running fiber that yields right
    /// after. Registering an event that is already present is a programming
    /// error and asserts.
    pub(crate) fn add_event(&self, fd: RawFd, ev: Event, cb: Option<FiberFn>) -> Result<(), Error> {
        assert!(
            ev == Event::READ || ev == Event::WRITE,
            "add_event: exactly one of READ or WRITE"
        );
        let ctx = self.fd_context(fd);
        let mut st = ctx.state.lock().unwrap();
        assert!(
            !st.events.contains(ev),
            "event {:?} already registered for fd {}",
            ev,
            fd
        );

        let op = if st.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | (st.events | ev).bits(),
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            let err = io::Error::last_os_error();
            log::error!("epoll_ctl add {:?} on fd {} failed: {}", ev, fd, err);
            return Err(err.into());
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        st.events |= ev;
        let ectx = st.context_mut(ev);
        debug_assert!(ectx.is_empty());
        // Dispatch on the scheduler of the registering thread; registrations
        // made from outside any worker fall back to the owning scheduler.
        ectx.scheduler = scheduler::current_core().or_else(|| self.sched.upgrade());
        match cb {
            Some(cb) => ectx.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                assert_eq!(
                    cur.state(),
                    State::Running,
                    "add_event without a callback requires a running fiber"
                );
                ectx.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Drop the registration without firing it.
    pub(crate) fn del_event(&self, fd: RawFd, ev: Event) -> bool {
        let ctx = match self.existing_fd_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut st = ctx.state.lock().unwrap();
        if !st.events.contains(ev) {
            return false;
        }

        let left = st.events - ev;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            log::error!(
                "epoll_ctl del {:?} on fd {} failed: {}",
                ev,
                fd,
                io::Error::last_os_error()
            );
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        st.events = left;
        st.context_mut(ev).reset();
        true
    }

    /// Drop the registration, firing its continuation exactly once on the
    /// way out. Timeouts use this to wake the parked fiber synthetically.
    pub(crate) fn cancel_event(&self, fd: RawFd, ev: Event) -> bool {
        let ctx = match self.existing_fd_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut st = ctx.state.lock().unwrap();
        if !st.events.contains(ev) {
            return false;
        }

        let left = st.events - ev;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | left.bits(),
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            log::error!(
                "epoll_ctl cancel {:?} on fd {} failed: {}",
                ev,
                fd,
                io::Error::last_os_error()
            );
            return false;
        }

        trigger_event(fd, &mut st, ev);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Unregister the fd entirely, firing any remaining continuations.
    /// `close` relies on this to wake every fiber parked on the fd.
    pub(crate) fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.existing_fd_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut st = ctx.state.lock().unwrap();
        if st.events.is_empty() {
            return false;
        }

        let mut ep = libc::epoll_event { events: 0, u64: 0 };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ep) } != 0 {
            log::error!(
                "epoll_ctl del-all on fd {} failed: {}",
                fd,
                io::Error::last_os_error()
            );
            return false;
        }

        if st.events.contains(Event::READ) {
            trigger_event(fd, &mut st, Event::READ);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if st.events.contains(Event::WRITE) {
            trigger_event(fd, &mut st, Event::WRITE);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        assert!(st.events.is_empty());
        true
    }

    pub(crate) fn timers(&self) -> &TimerSet {
        &self.timers
    }

    pub(crate) fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    pub(crate) fn schedule_fiber(&self, f: FiberRef) {
        if let Some(sched) = self.sched.upgrade() {
            sched.push_task(Task {
                work: Work::Fiber(f),
                thread: None,
            });
        }
    }
}

impl SchedulerExt for IoCore {
    fn bind_thread(self: Arc<Self>) {
        CURRENT_IO.with(|c| *c.borrow_mut() = Some(Arc::downgrade(&self)));
        // I/O workers intercept blocking calls out of the box; fibers hop
        // between workers, and a half-hooked pool degrades to blocking.
        hook::set_hook_enabled(true);
    }

    /// Wake one idle worker by writing a byte into the self-pipe. With no
    /// idle worker there is nobody to wake, and every dispatching worker
    /// rechecks the queue before parking anyway.
    fn tickle(&self) {
        let any_idle = self
            .sched
            .upgrade()
            .map_or(false, |s| s.has_idle_threads());
        if !any_idle {
            return;
        }
        let n = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1, "tickle pipe write failed");
    }

    /// The epoll idle loop, run inside each worker's idle fiber.
    fn idle(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let mut cbs = Vec::new();
        loop {
            let next_timeout = self.timers.next_timeout();
            if next_timeout.is_none()
                && self.pending_events.load(Ordering::SeqCst) == 0
                && self.sched.upgrade().map_or(true, |s| s.base_stopped())
            {
                break;
            }
            let timeout_ms = next_timeout.unwrap_or(MAX_TIMEOUT_MS).min(MAX_TIMEOUT_MS);

            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout_ms as libc::c_int,
                    )
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                panic!("epoll_wait failed: {}", err);
            };

            self.timers.list_expired(&mut cbs);
            if !cbs.is_empty() {
                if let Some(sched) = self.sched.upgrade() {
                    for cb in cbs.drain(..) {
                        sched.push_task(Task {
                            work: Work::Call(Box::new(move || cb())),
                            thread: None,
                        });
                    }
                }
            }

            for ep in &events[..n] {
                if ep.u64 == self.tickle_fds[0] as u64 {
                    // Edge triggered: drain the pipe completely.
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                let ctx = unsafe { &*(ep.u64 as *const FdContext) };
                let mut st = ctx.state.lock().unwrap();

                let mut fired = ep.events;
                if fired & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Promote errors and hangups into whatever is registered,
                    // otherwise the waiter would never be woken.
                    fired |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & st.events.bits();
                }
                let real_events = Event::from_bits_truncate(fired) & st.events;
                if real_events.is_empty() {
                    continue;
                }

                let left = st.events - real_events;
                let op = if left.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                let mut rearm = libc::epoll_event {
                    events: libc::EPOLLET as u32 | left.bits(),
                    u64: ep.u64,
                };
                if unsafe { libc::epoll_ctl(self.epfd, op, ctx.fd, &mut rearm) } != 0 {
                    log::error!(
                        "epoll_ctl rearm on fd {} failed: {}",
                        ctx.fd,
                        io::Error::last_os_error()
                    );
                    continue;
                }

                if real_events.contains(Event::READ) {
                    trigger_event(ctx.fd, &mut st, Event::READ);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if real_events.contains(Event::WRITE) {
                    trigger_event(ctx.fd, &mut st, Event::WRITE);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Yield so the dispatch loop picks up whatever got scheduled.
            fiber::fiber_yield();
        }
    }

    /// Stricter than the base condition: pending I/O and timers also hold
    /// the scheduler open.
    fn stopped(&self) -> bool {
        !self.timers.has_timer()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.sched.upgrade().map_or(true, |s| s.base_stopped())
    }
}

impl Drop for IoCore {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

/// A scheduler whose idle workers park in epoll, with per-fd one-shot event
/// registration and an embedded timer set.
pub struct IoScheduler {
    sched: Scheduler,
    io: Arc<IoCore>,
}

impl IoScheduler {
    /// Create an I/O scheduler. Failure to set up epoll or the self-pipe is
    /// fatal: the runtime cannot operate without them.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> IoScheduler {
        let sched = Scheduler::new(threads, use_caller, name);

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(
            epfd >= 0,
            "epoll_create1 failed: {}",
            io::Error::last_os_error()
        );
        let mut tickle_fds = [0; 2];
        assert_eq!(
            unsafe { libc::pipe(tickle_fds.as_mut_ptr()) },
            0,
            "tickle pipe creation failed: {}",
            io::Error::last_os_error()
        );
        // Nonblocking read end, edge triggered registration.
        let flags = unsafe { libc::fcntl(tickle_fds[0], libc::F_GETFL, 0) };
        assert!(flags >= 0);
        assert_eq!(
            unsafe { libc::fcntl(tickle_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) },
            0
        );
        let mut ep = libc::epoll_event {
            events: libc::EPOLLIN as u32 | libc::EPOLLET as u32,
            u64: tickle_fds[0] as u64,
        };
        assert_eq!(
            unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fds[0], &mut ep) },
            0,
            "registering the tickle pipe failed"
        );

        let io = Arc::new(IoCore {
            epfd,
            tickle_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new({
                let mut v = Vec::new();
                v.resize(32, None);
                v
            }),
            timers: TimerSet::new(),
            sched: Arc::downgrade(sched.core()),
        });

        let weak = Arc::downgrade(&io);
        io.timers.set_notifier(Box::new(move || {
            // A timer slid in front of the current epoll timeout.
            if let Some(io) = weak.upgrade() {
                SchedulerExt::tickle(&*io);
            }
        }));
        let io_dyn: Arc<dyn SchedulerExt> = io.clone();
        let ext: Weak<dyn SchedulerExt> = Arc::downgrade(&io_dyn);
        sched.core().set_ext(ext);

        IoScheduler { sched, io }
    }

    /// Register one-shot interest with the current fiber as continuation.
    /// The caller must yield right after; it is resumed when the event
    /// fires, is cancelled, or its timeout hits.
    pub fn add_event(&self, fd: RawFd, ev: Event) -> Result<(), Error> {
        self.io.add_event(fd, ev, None)
    }

    /// Register one-shot interest dispatching `cb` when the event fires.
    pub fn add_event_with<F>(&self, fd: RawFd, ev: Event, cb: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.io.add_event(fd, ev, Some(Box::new(cb)))
    }

    /// Remove a registration without firing it.
    pub fn del_event(&self, fd: RawFd, ev: Event) -> bool {
        self.io.del_event(fd, ev)
    }

    /// Remove a registration, firing its continuation exactly once.
    pub fn cancel_event(&self, fd: RawFd, ev: Event) -> bool {
        self.io.cancel_event(fd, ev)
    }

    /// Remove and fire everything registered on `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.io.cancel_all(fd)
    }

    /// Insert a timer due in `ms` milliseconds.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.io.timers.add_timer(ms, cb, recurring)
    }

    /// Insert a timer that only fires while `cond` still resolves.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.io.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// Number of registered, not yet triggered events.
    pub fn pending_event_count(&self) -> usize {
        self.io.pending_event_count()
    }
}

impl std::ops::Deref for IoScheduler {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        self.sched.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bits_match_epoll() {
        assert_eq!(Event::READ.bits(), libc::EPOLLIN as u32);
        assert_eq!(Event::WRITE.bits(), libc::EPOLLOUT as u32);
        assert!((Event::READ | Event::WRITE).contains(Event::READ));
    }
}
