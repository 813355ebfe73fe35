use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use corio::{fiber_yield, Fiber, Scheduler};

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn yielded_fiber_resumes_exactly_once() {
    let sched = Scheduler::new(3, false, "coop");
    sched.start();

    let done = Arc::new(AtomicUsize::new(0));
    let d = done.clone();
    sched.schedule(move || {
        // Re-enqueue ourselves, give up the processor, then finish.
        let me = Fiber::current();
        Scheduler::current().unwrap().schedule_fiber(me);
        fiber_yield();
        d.fetch_add(1, Ordering::SeqCst);
    });

    assert!(
        wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 1),
        "fiber never finished"
    );
    sched.stop();
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[test]
fn single_worker_runs_tasks_in_fifo_order() {
    let sched = Scheduler::new(1, false, "fifo");
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10 {
        let order = order.clone();
        sched.schedule(move || order.lock().unwrap().push(i));
    }
    sched.start();
    assert!(wait_until(Duration::from_secs(5), || order.lock().unwrap().len() == 10));
    sched.stop();
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
}

#[test]
fn caller_thread_drains_queue_on_stop() {
    let sched = Scheduler::new(1, true, "caller");
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let hits = hits.clone();
        sched.schedule(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    // One thread total and it is ours: nothing can have run yet.
    sched.start();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    sched.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 5);
}

#[test]
fn thread_affinity_is_honored() {
    let sched = Scheduler::new(3, false, "pinned");
    sched.start();

    // Learn one worker's id.
    let (tx, rx) = mpsc::channel();
    sched.schedule(move || {
        tx.send(thread::current().id()).unwrap();
    });
    let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let on_target = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let ran = ran.clone();
        let on_target = on_target.clone();
        sched.schedule_to(
            move || {
                if thread::current().id() == worker {
                    on_target.fetch_add(1, Ordering::SeqCst);
                }
                ran.fetch_add(1, Ordering::SeqCst);
            },
            worker,
        );
    }
    assert!(wait_until(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 8));
    sched.stop();
    assert_eq!(on_target.load(Ordering::SeqCst), 8);
}

#[test]
fn stop_joins_all_workers() {
    let sched = Scheduler::new(4, false, "join");
    sched.start();
    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..32 {
        let hits = hits.clone();
        sched.schedule(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) == 32));
    sched.stop();
    // After stop returns every queued task has run and the pool is gone;
    // a second stop is a no-op.
    assert_eq!(hits.load(Ordering::SeqCst), 32);
    sched.stop();
}
