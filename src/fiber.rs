//! Fibers
//!
//! A fiber is a stackful execution context that is cooperatively multiplexed
//! in user space: it owns a private stack, saves and restores CPU state with
//! the SysV ucontext calls, and only ever gives up the processor at an
//! explicit [yield](struct.Fiber.html#method.yield_now).
//!
//! A fiber has three possible states: **ready**, **running** or **terminated**.
//! A freshly created fiber is ready. [resume()](struct.Fiber.html#method.resume)
//! makes it running, [yield_now()](struct.Fiber.html#method.yield_now) makes it
//! ready again, and when the fiber function returns it becomes terminated.
//! Only a terminated fiber may be [reset()](struct.Fiber.html#method.reset)
//! with a new function, reusing its stack.
//!
//! Every OS thread lazily gets a **thread-root fiber** representing its
//! natural stack; it is created by the first call to
//! [Fiber::current()](struct.Fiber.html#method.current) on that thread and is
//! always running while no other fiber is.
use std::alloc::{self, Layout};
use std::cell::{RefCell, UnsafeCell};
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::scheduler;

/// Default fiber stack size, 128 KiB.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

const STACK_ALIGN: usize = 16;

/// Shared fiber handle. A fiber is simultaneously visible from the task
/// queue, from event contexts and from the resuming worker's stack, so
/// handles are reference counted.
pub type FiberRef = Arc<Fiber>;

pub(crate) type FiberFn = Box<dyn FnOnce() + Send + 'static>;

static FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<FiberRef>> = RefCell::new(None);
    static THREAD_ROOT: RefCell<Option<FiberRef>> = RefCell::new(None);
}

/// Fiber lifecycle state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Just created, reset, or yielded; eligible for resume.
    Ready = 0,
    /// Currently executing. At most one fiber per OS thread is running.
    Running = 1,
    /// The fiber function returned. Terminal, except for `reset`.
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Term,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }
}

/// Fiber creation attributes: stack size and whether the fiber is driven by
/// a scheduler.
///
/// `run_in_scheduler` selects the peer context the fiber swaps with: a
/// scheduler-driven fiber always swaps with the dispatch fiber of the worker
/// thread it runs on, while a free-standing fiber swaps with the thread-root
/// fiber. Mixing the two up would return control to the wrong stack, so the
/// choice is fixed at creation time.
#[derive(Debug, Clone)]
pub struct FiberAttr {
    stack_size: usize,
    run_in_scheduler: bool,
}

impl Default for FiberAttr {
    fn default() -> Self {
        FiberAttr {
            stack_size: DEFAULT_STACK_SIZE,
            run_in_scheduler: true,
        }
    }
}

impl FiberAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Set stack size for fibers created with this attribute.
    /// Zero means the default.
    pub fn set_stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        self
    }

    pub fn set_run_in_scheduler(&mut self, flag: bool) -> &mut Self {
        self.run_in_scheduler = flag;
        self
    }
}

/// A fiber-owned stack region. Allocation failure is fatal, the runtime
/// cannot continue without a stack.
struct Stack {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Stack {
    fn alloc(size: usize) -> Stack {
        let layout =
            Layout::from_size_align(size, STACK_ALIGN).expect("invalid fiber stack size");
        let ptr = unsafe { alloc::alloc(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        Stack { ptr, layout }
    }

    fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

unsafe impl Send for Stack {}

struct FiberInner {
    ctx: libc::ucontext_t,
    stack: Option<Stack>,
    cb: Option<FiberFn>,
}

/// A stackful cooperative execution context.
///
/// See the [module level documentation](index.html) for the lifecycle.
pub struct Fiber {
    id: u64,
    run_in_scheduler: bool,
    state: AtomicU8,
    /// Back-reference to the owning `Arc`, so a plain `&Fiber` can hand out
    /// strong handles (the current-fiber slot needs one during resume).
    self_ref: Weak<Fiber>,
    inner: UnsafeCell<FiberInner>,
}

// A fiber is moved between worker threads, but its mutable internals are
// only ever touched by the single thread currently resuming or running it;
// `state` is atomic because the dispatch loop inspects it cross-thread.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a new ready fiber with default attributes (128 KiB stack,
    /// scheduler-driven).
    pub fn new<F>(cb: F) -> FiberRef
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_with_attr(cb, &FiberAttr::default())
    }

    /// Create a new ready fiber with explicit attributes.
    pub fn new_with_attr<F>(cb: F, attr: &FiberAttr) -> FiberRef
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = Stack::alloc(attr.stack_size);
        let mut ctx: libc::ucontext_t = unsafe { mem::zeroed() };
        unsafe { make_context(&mut ctx, &stack) };
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|self_ref| Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler: attr.run_in_scheduler,
            state: AtomicU8::new(State::Ready as u8),
            self_ref: self_ref.clone(),
            inner: UnsafeCell::new(FiberInner {
                ctx,
                stack: Some(stack),
                cb: Some(Box::new(cb)),
            }),
        })
    }

    // The thread-root fiber: no stack of its own, born running. Its context
    // slot is filled by the first swap away from this thread's natural stack.
    fn root() -> FiberRef {
        let mut ctx: libc::ucontext_t = unsafe { mem::zeroed() };
        if unsafe { libc::getcontext(&mut ctx) } != 0 {
            panic!("getcontext failed: {}", io::Error::last_os_error());
        }
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|self_ref| Fiber {
            id: FIBER_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler: false,
            state: AtomicU8::new(State::Running as u8),
            self_ref: self_ref.clone(),
            inner: UnsafeCell::new(FiberInner {
                ctx,
                stack: None,
                cb: None,
            }),
        })
    }

    /// The fiber currently executing on this thread.
    ///
    /// The first call on a thread creates the thread-root fiber; later calls
    /// are idempotent.
    pub fn current() -> FiberRef {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let root = Fiber::root();
        CURRENT.with(|c| *c.borrow_mut() = Some(root.clone()));
        THREAD_ROOT.with(|c| *c.borrow_mut() = Some(root.clone()));
        root
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Switch this fiber to the running state.
    ///
    /// The caller's context is saved into the appropriate peer (the worker's
    /// dispatch fiber for scheduler-driven fibers, the thread-root fiber
    /// otherwise) and control enters this fiber. Returns when the fiber
    /// yields or terminates.
    pub fn resume(&self) {
        assert_eq!(
            self.state(),
            State::Ready,
            "resume: fiber {} is not ready",
            self.id
        );
        // Materialize the thread-root fiber before the first switch.
        let _ = Fiber::current();
        let peer = self.peer();
        CURRENT.with(|c| *c.borrow_mut() = Some(self.strong()));
        self.set_state(State::Running);
        unsafe { swap_context(&peer, self) };
    }

    /// Give up the processor: save this fiber's context and switch back to
    /// its peer. A running fiber becomes ready; a terminated fiber (the
    /// trampoline's final yield) stays terminated and never runs again.
    pub fn yield_now(&self) {
        let state = self.state();
        assert!(
            state == State::Running || state == State::Term,
            "yield: fiber {} is neither running nor terminated",
            self.id
        );
        let peer = self.peer();
        CURRENT.with(|c| *c.borrow_mut() = Some(peer.clone()));
        if state != State::Term {
            self.set_state(State::Ready);
        }
        unsafe { swap_context(self, &peer) };
    }

    /// Rearm a terminated fiber with a new function, reusing its stack.
    pub fn reset<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert_eq!(
            self.state(),
            State::Term,
            "reset: fiber {} has not terminated",
            self.id
        );
        let inner = unsafe { &mut *self.inner.get() };
        let stack = inner.stack.as_ref().expect("reset: thread-root fiber");
        unsafe { make_context(&mut inner.ctx, stack) };
        inner.cb = Some(Box::new(cb));
        self.set_state(State::Ready);
    }

    fn strong(&self) -> FiberRef {
        self.self_ref.upgrade().expect("fiber outlived every handle")
    }

    fn peer(&self) -> FiberRef {
        if self.run_in_scheduler {
            scheduler::current_dispatch_fiber()
                .expect("scheduler-driven fiber on a thread with no dispatch fiber")
        } else {
            THREAD_ROOT
                .with(|r| r.borrow().clone())
                .expect("thread-root fiber is not initialized")
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.inner.get_mut().stack.is_some() {
            assert_eq!(
                self.state(),
                State::Term,
                "fiber {} dropped before termination",
                self.id
            );
        }
    }
}

/// Yield the current fiber.
pub fn fiber_yield() {
    let cur = Fiber::current();
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    // The fiber stays alive across the switch: whoever resumed it still
    // holds a handle, and the current-fiber slot is updated inside yield.
    unsafe { (*raw).yield_now() };
}

/// Id of the current fiber, 0 if the thread has none yet.
pub fn fiber_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id()).unwrap_or(0))
}

/// Number of live fibers in the process, thread-root fibers included.
pub fn fiber_count() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

// Entry point of every stackful fiber. It takes no arguments: the fiber is
// recovered from the thread-local current pointer that resume() set before
// switching here.
extern "C" fn fiber_entry() {
    let cur = Fiber::current();
    let cb = unsafe { (*cur.inner.get()).cb.take() }.expect("fiber entered without a callback");
    // A panic must not unwind through makecontext frames.
    if let Err(err) = panic::catch_unwind(AssertUnwindSafe(cb)) {
        let msg = err
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| err.downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("Box<dyn Any>");
        log::error!("fiber {} panicked: {}", cur.id(), msg);
    }
    cur.set_state(State::Term);
    // Drop the strong handle down to a raw view before the final switch so
    // the last holder can free the fiber once control has left this stack.
    let raw = Arc::as_ptr(&cur);
    drop(cur);
    unsafe { (*raw).yield_now() };
    unreachable!("terminated fiber resumed");
}

unsafe fn make_context(ctx: &mut libc::ucontext_t, stack: &Stack) {
    if libc::getcontext(ctx) != 0 {
        panic!("getcontext failed: {}", io::Error::last_os_error());
    }
    ctx.uc_link = ptr::null_mut();
    ctx.uc_stack.ss_sp = stack.ptr.as_ptr() as *mut libc::c_void;
    ctx.uc_stack.ss_size = stack.size();
    libc::makecontext(ctx, fiber_entry, 0);
}

// Save the current machine context into `save` and activate `load`.
// Both slots are exclusively owned by this thread for the duration of the
// call: `save` is the fiber control is leaving, `load` is ready and not
// visible to any other runner until its state says so.
unsafe fn swap_context(save: &Fiber, load: &Fiber) {
    let save_ctx = &mut (*save.inner.get()).ctx as *mut libc::ucontext_t;
    let load_ctx = &(*load.inner.get()).ctx as *const libc::ucontext_t;
    if libc::swapcontext(save_ctx, load_ctx) != 0 {
        panic!("swapcontext failed: {}", io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn free_standing() -> FiberAttr {
        let mut attr = FiberAttr::new();
        attr.set_run_in_scheduler(false);
        attr
    }

    #[test]
    fn current_is_idempotent() {
        let a = Fiber::current();
        let b = Fiber::current();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.state(), State::Running);
    }

    #[test]
    fn resume_yield_resume() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();
        let fiber = Fiber::new_with_attr(
            move || {
                steps2.fetch_add(1, Ordering::SeqCst);
                fiber_yield();
                steps2.fetch_add(1, Ordering::SeqCst);
            },
            &free_standing(),
        );
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new_with_attr(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            &free_standing(),
        );
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn panicking_fiber_terminates() {
        let fiber = Fiber::new_with_attr(
            || {
                panic!("boom");
            },
            &free_standing(),
        );
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }
}
