//! N:M fiber scheduler
//!
//! A [Scheduler](struct.Scheduler.html) owns a pool of worker threads that
//! cooperatively multiplex fibers: each worker runs the dispatch loop,
//! pulling tasks (fibers or bare callbacks) from a shared FIFO queue and
//! resuming them until they yield or terminate.
//!
//! With `use_caller` the constructing thread donates itself as one of the
//! workers: a dedicated dispatch fiber bound to the run loop is created on
//! it and resumed by [stop()](struct.Scheduler.html#method.stop), which
//! drains the remaining work before joining the pool.
//!
//! When the queue is empty a worker parks in its idle fiber. The base
//! scheduler's idle simply keeps yielding back until stop; the I/O scheduler
//! in [coio](../coio/index.html) replaces it with an epoll wait.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crate::fiber::{self, Fiber, FiberAttr, FiberFn, FiberRef, State};

thread_local! {
    static CURRENT_CORE: RefCell<Option<Arc<SchedulerCore>>> = RefCell::new(None);
    static DISPATCH: RefCell<Option<FiberRef>> = RefCell::new(None);
}

/// The scheduler running on this worker thread, if any.
pub(crate) fn current_core() -> Option<Arc<SchedulerCore>> {
    CURRENT_CORE.with(|c| c.borrow().clone())
}

/// The dispatch fiber of this worker thread. Scheduler-driven fibers swap
/// with it, never with the thread-root fiber.
pub(crate) fn current_dispatch_fiber() -> Option<FiberRef> {
    DISPATCH.with(|d| d.borrow().clone())
}

pub(crate) enum Work {
    Fiber(FiberRef),
    Call(FiberFn),
}

/// A queued scheduling record: one unit of work plus an optional worker
/// affinity. `thread == None` means any worker may take it.
pub(crate) struct Task {
    pub(crate) work: Work,
    pub(crate) thread: Option<ThreadId>,
}

/// Overridable scheduler behavior, the seam the I/O scheduler plugs into.
pub(crate) trait SchedulerExt: Send + Sync {
    /// Called once on every worker thread before it enters the dispatch loop.
    fn bind_thread(self: Arc<Self>);
    /// Wake one idle worker.
    fn tickle(&self);
    /// Body of the idle fiber.
    fn idle(&self);
    /// Full stop condition, checked by `stop()`.
    fn stopped(&self) -> bool;
}

pub(crate) struct SchedulerCore {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Workers to spawn, not counting a donated caller thread.
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    use_caller: bool,
    root_thread: Option<ThreadId>,
    /// The caller thread's dispatch fiber, present only with `use_caller`.
    root_fiber: Mutex<Option<FiberRef>>,
    ext: Mutex<Option<Weak<dyn SchedulerExt>>>,
}

impl SchedulerCore {
    pub(crate) fn set_ext(&self, ext: Weak<dyn SchedulerExt>) {
        *self.ext.lock().unwrap() = Some(ext);
    }

    fn ext(&self) -> Option<Arc<dyn SchedulerExt>> {
        self.ext.lock().unwrap().as_ref().and_then(|w| w.upgrade())
    }

    /// Enqueue a task; wake an idle worker iff the queue was empty. A task
    /// slipped into a non-empty queue is always seen: every idle pass yields
    /// back through the dispatch loop before the worker parks again.
    pub(crate) fn push_task(&self, task: Task) {
        let need_tickle = {
            let mut tasks = self.tasks.lock().unwrap();
            let was_empty = tasks.is_empty();
            tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    pub(crate) fn tickle(&self) {
        if let Some(ext) = self.ext() {
            ext.tickle();
        }
    }

    /// Stop condition of the plain scheduler: stop requested, queue drained,
    /// nobody mid-dispatch.
    pub(crate) fn base_stopped(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.tasks.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    fn stopped(&self) -> bool {
        match self.ext() {
            Some(ext) => ext.stopped(),
            None => self.base_stopped(),
        }
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }
}

/// A pool of worker threads dispatching fibers from a shared task queue.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers.
    ///
    /// With `use_caller` the constructing thread counts as one of the
    /// workers; it starts participating when `stop()` drains it.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one thread");
        let (thread_count, root_thread) = if use_caller {
            (threads - 1, Some(thread::current().id()))
        } else {
            (threads, None)
        };
        let core = Arc::new(SchedulerCore {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            use_caller,
            root_thread,
            root_fiber: Mutex::new(None),
            ext: Mutex::new(None),
        });
        if use_caller {
            bind_caller(&core);
        }
        Scheduler { core }
    }

    /// The scheduler driving the current worker thread, if any.
    pub fn current() -> Option<Scheduler> {
        current_core().map(|core| Scheduler { core })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Spawn the worker threads. Failure to spawn is fatal.
    pub fn start(&self) {
        let mut threads = self.core.threads.lock().unwrap();
        if self.core.stopping.load(Ordering::SeqCst) {
            return;
        }
        assert!(threads.is_empty(), "scheduler {} started twice", self.core.name);
        for i in 0..self.core.thread_count {
            let core = self.core.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.core.name, i))
                .spawn(move || run(core))
                .expect("failed to spawn scheduler worker thread");
            threads.push(handle);
        }
        log::debug!(
            "scheduler {}: started {} worker(s){}",
            self.core.name,
            self.core.thread_count,
            if self.core.use_caller { " plus caller" } else { "" }
        );
    }

    /// Request a stop, drain pending work and join every worker.
    pub fn stop(&self) {
        if self.core.stopped() {
            return;
        }
        self.core.stopping.store(true, Ordering::SeqCst);
        if self.core.use_caller {
            // The drain below must run on the donated thread itself.
            assert!(
                current_core().map_or(false, |c| Arc::ptr_eq(&c, &self.core)),
                "a caller-backed scheduler can only be stopped from its own thread"
            );
        }

        for _ in 0..self.core.thread_count {
            self.core.tickle();
        }
        let root_fiber = self.core.root_fiber.lock().unwrap().take();
        if let Some(root_fiber) = root_fiber {
            self.core.tickle();
            root_fiber.resume();
        }

        let threads: Vec<_> = self.core.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            handle.join().expect("scheduler worker panicked");
        }
        if self.core.use_caller {
            CURRENT_CORE.with(|c| *c.borrow_mut() = None);
            DISPATCH.with(|d| *d.borrow_mut() = None);
        }
        log::debug!("scheduler {}: stopped", self.core.name);
    }

    /// Enqueue a callback to run as a fiber on any worker.
    pub fn schedule<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push_task(Task {
            work: Work::Call(Box::new(cb)),
            thread: None,
        });
    }

    /// Enqueue a callback pinned to the worker with the given thread id.
    pub fn schedule_to<F>(&self, cb: F, thread: ThreadId)
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.push_task(Task {
            work: Work::Call(Box::new(cb)),
            thread: Some(thread),
        });
    }

    /// Enqueue a ready fiber to be resumed on any worker.
    pub fn schedule_fiber(&self, fiber: FiberRef) {
        self.core.push_task(Task {
            work: Work::Fiber(fiber),
            thread: None,
        });
    }

    /// Enqueue a ready fiber pinned to the worker with the given thread id.
    pub fn schedule_fiber_to(&self, fiber: FiberRef, thread: ThreadId) {
        self.core.push_task(Task {
            work: Work::Fiber(fiber),
            thread: Some(thread),
        });
    }

    pub(crate) fn core(&self) -> &Arc<SchedulerCore> {
        &self.core
    }
}

fn bind_caller(core: &Arc<SchedulerCore>) {
    // Materialize the caller's thread-root fiber before any switching.
    let _ = Fiber::current();
    assert!(
        current_core().is_none(),
        "thread already donated to another scheduler"
    );
    CURRENT_CORE.with(|c| *c.borrow_mut() = Some(core.clone()));

    // The caller's main flow is not driven by the dispatch loop, so its
    // dispatch fiber swaps with the thread root, not with itself.
    let run_core = core.clone();
    let mut attr = FiberAttr::new();
    attr.set_run_in_scheduler(false);
    let dispatch = Fiber::new_with_attr(move || run(run_core), &attr);
    DISPATCH.with(|d| *d.borrow_mut() = Some(dispatch.clone()));
    *core.root_fiber.lock().unwrap() = Some(dispatch);
}

/// The dispatch loop, executed by every worker (and by the caller's
/// dispatch fiber during the stop drain).
fn run(core: Arc<SchedulerCore>) {
    log::debug!("scheduler {}: dispatch loop entered", core.name);
    CURRENT_CORE.with(|c| *c.borrow_mut() = Some(core.clone()));
    if let Some(ext) = core.ext() {
        ext.bind_thread();
    }
    if core.root_thread != Some(thread::current().id()) {
        // On a plain worker the dispatch fiber is the thread root itself.
        DISPATCH.with(|d| *d.borrow_mut() = Some(Fiber::current()));
    }

    let idle_core = core.clone();
    let idle_fiber = Fiber::new(move || match idle_core.ext() {
        Some(ext) => ext.idle(),
        None => base_idle(&idle_core),
    });
    let mut thunk_fiber: Option<FiberRef> = None;

    loop {
        let mut work = None;
        let mut tickle_me = false;
        {
            let mut tasks = core.tasks.lock().unwrap();
            let mut i = 0;
            while i < tasks.len() {
                if let Some(thread) = tasks[i].thread {
                    if thread != thread::current().id() {
                        // Pinned elsewhere; make sure some other worker wakes.
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                }
                if let Work::Fiber(f) = &tasks[i].work {
                    // Enqueued (e.g. by a triggered event) before it finished
                    // yielding on another worker; retry on a later pass.
                    if f.state() == State::Running {
                        i += 1;
                        continue;
                    }
                }
                let task = tasks.remove(i).expect("task index in range");
                core.active_threads.fetch_add(1, Ordering::SeqCst);
                if i < tasks.len() {
                    tickle_me = true;
                }
                work = Some(task.work);
                break;
            }
        }
        if tickle_me {
            core.tickle();
        }

        match work {
            Some(Work::Fiber(f)) => {
                f.resume();
                core.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            Some(Work::Call(cb)) => {
                let f = match thunk_fiber.take() {
                    Some(f) => {
                        f.reset(cb);
                        f
                    }
                    None => Fiber::new(cb),
                };
                f.resume();
                core.active_threads.fetch_sub(1, Ordering::SeqCst);
                if f.state() == State::Term {
                    // Terminated cleanly: keep the wrapper for the next
                    // bare callback. A yielded wrapper is owned by whoever
                    // re-enqueued it and must not be reset.
                    thunk_fiber = Some(f);
                }
            }
            None => {
                if idle_fiber.state() == State::Term {
                    // The idle fiber only terminates once the stop condition
                    // held; the worker is done.
                    break;
                }
                core.idle_threads.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                core.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
    log::debug!("scheduler {}: dispatch loop exited", core.name);
}

fn base_idle(core: &SchedulerCore) {
    while !core.base_stopped() {
        fiber::fiber_yield();
    }
}
