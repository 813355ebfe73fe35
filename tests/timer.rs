use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use corio::{IoScheduler, Timer};

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
fn recurring_timer_cancels_itself_at_four() {
    let sched = IoScheduler::new(3, false, "recurring");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));
    let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));
    let c = count.clone();
    let s = slot.clone();
    let timer = sched.add_timer(
        50,
        move || {
            if c.fetch_add(1, Ordering::SeqCst) + 1 >= 4 {
                if let Some(timer) = s.lock().unwrap().take() {
                    timer.cancel();
                }
            }
        },
        true,
    );
    *slot.lock().unwrap() = Some(timer);

    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) >= 4));
    // Give a cancelled timer every chance to misfire.
    thread::sleep(Duration::from_millis(300));
    sched.stop();
    assert_eq!(count.load(Ordering::SeqCst), 4);
}

#[test]
fn one_shot_timer_fires_once() {
    let sched = IoScheduler::new(1, false, "oneshot");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let start = Instant::now();
    sched.add_timer(
        100,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 1));
    assert!(
        start.elapsed() >= Duration::from_millis(90),
        "timer fired early: {:?}",
        start.elapsed()
    );
    thread::sleep(Duration::from_millis(200));
    sched.stop();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_timer_does_not_fire() {
    let sched = IoScheduler::new(1, false, "cancel");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let timer = sched.add_timer(
        100,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    assert!(timer.cancel());
    assert!(!timer.cancel());
    thread::sleep(Duration::from_millis(300));
    sched.stop();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn condition_timer_requires_live_witness() {
    let sched = IoScheduler::new(1, false, "witness");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));

    let witness = Arc::new(());
    let weak = Arc::downgrade(&witness);
    drop(witness);
    let c = count.clone();
    sched.add_condition_timer(
        50,
        move || {
            c.fetch_add(100, Ordering::SeqCst);
        },
        weak,
        false,
    );

    let live = Arc::new(());
    let c = count.clone();
    sched.add_condition_timer(
        50,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&live),
        false,
    );

    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) > 0));
    thread::sleep(Duration::from_millis(100));
    sched.stop();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    drop(live);
}

#[test]
fn timer_reset_pushes_deadline_out() {
    let sched = IoScheduler::new(1, false, "reset");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let timer = sched.add_timer(
        60_000,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    // Pull the far-out deadline close instead.
    assert!(timer.reset(50, true));
    assert!(wait_until(Duration::from_secs(5), || count.load(Ordering::SeqCst) == 1));
    sched.stop();
}
