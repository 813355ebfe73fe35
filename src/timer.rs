//! Timer set
//!
//! An ordered set of absolute-deadline timers over the monotonic clock.
//! Timers are one-shot or recurring; a **conditional** timer additionally
//! carries a weak witness and fires only while the witness still resolves,
//! which lets hooked I/O arm a timeout against a fiber that may be gone by
//! the time the deadline hits.
//!
//! The set itself does not wake anybody: whoever embeds it (the I/O
//! scheduler) installs a notifier that is invoked when a new timer becomes
//! the soonest deadline, and periodically drains expired callbacks with
//! [list_expired()](struct.TimerSet.html#method.list_expired).
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock;

/// A clock step this far backwards is treated as a rollover: every pending
/// timer is fired once rather than stalling until the clock catches up.
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

pub(crate) type TimerCb = Arc<dyn Fn() + Send + Sync + 'static>;

static TIMER_ID: AtomicU64 = AtomicU64::new(0);

struct TimerInner {
    id: u64,
    recurring: bool,
    /// Relative period; the deadline is re-derived from it on refresh and
    /// on recurring re-insertion.
    period_ms: AtomicU64,
    /// Absolute deadline, monotonic ms. Mutated only under the owning set's
    /// write lock.
    deadline_ms: AtomicU64,
    /// Cancelled timers have the callback cleared.
    cb: Mutex<Option<TimerCb>>,
    /// The set outlives every timer it contains, hence non-owning.
    owner: Weak<TimerSetShared>,
}

impl TimerInner {
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::SeqCst), self.id)
    }
}

/// Handle to a timer inside a [TimerSet](struct.TimerSet.html).
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Cancel the timer: clear its callback and remove it from the set.
    /// Returns false if it already fired or was already cancelled.
    pub fn cancel(&self) -> bool {
        let shared = match self.inner.owner.upgrade() {
            Some(s) => s,
            None => return false,
        };
        let mut set = shared.inner.write().unwrap();
        let mut cb = self.inner.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        set.timers.remove(&self.inner.key());
        true
    }

    /// Push the deadline out to now + period.
    pub fn refresh(&self) -> bool {
        let shared = match self.inner.owner.upgrade() {
            Some(s) => s,
            None => return false,
        };
        let mut set = shared.inner.write().unwrap();
        if self.inner.cb.lock().unwrap().is_none() {
            return false;
        }
        if set.timers.remove(&self.inner.key()).is_none() {
            return false;
        }
        let deadline = clock::monotonic64() + self.inner.period_ms.load(Ordering::SeqCst);
        self.inner.deadline_ms.store(deadline, Ordering::SeqCst);
        set.timers.insert(self.inner.key(), self.inner.clone());
        true
    }

    /// Change the period. With `from_now` the deadline becomes now + ms,
    /// otherwise the current deadline is kept and only the period changes.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.inner.period_ms.load(Ordering::SeqCst) && !from_now {
            return true;
        }
        let shared = match self.inner.owner.upgrade() {
            Some(s) => s,
            None => return false,
        };
        {
            let mut set = shared.inner.write().unwrap();
            if self.inner.cb.lock().unwrap().is_none() {
                return false;
            }
            if set.timers.remove(&self.inner.key()).is_none() {
                return false;
            }
            let start = if from_now {
                clock::monotonic64()
            } else {
                self.inner.deadline_ms.load(Ordering::SeqCst).saturating_sub(ms)
            };
            self.inner.period_ms.store(ms, Ordering::SeqCst);
            self.inner.deadline_ms.store(start + ms, Ordering::SeqCst);
        }
        // Re-seating may have produced a new soonest deadline.
        shared.insert(self.inner.clone());
        true
    }
}

struct TimerSetInner {
    timers: BTreeMap<(u64, u64), Arc<TimerInner>>,
    /// Set once a front-insertion notification went out; cleared when the
    /// consumer reads the next timeout. Suppresses duplicate wakeups.
    tickled: bool,
    previous_ms: u64,
}

struct TimerSetShared {
    inner: RwLock<TimerSetInner>,
    notify: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerSetShared {
    fn insert(&self, timer: Arc<TimerInner>) {
        let key = timer.key();
        let at_front = {
            let mut set = self.inner.write().unwrap();
            set.timers.insert(key, timer);
            let is_first = set.timers.keys().next() == Some(&key);
            if is_first && !set.tickled {
                set.tickled = true;
                true
            } else {
                false
            }
        };
        if at_front {
            if let Some(notify) = &*self.notify.lock().unwrap() {
                notify();
            }
        }
    }
}

/// An ordered set of timers keyed by (deadline, identity).
pub struct TimerSet {
    shared: Arc<TimerSetShared>,
}

impl TimerSet {
    pub fn new() -> TimerSet {
        TimerSet {
            shared: Arc::new(TimerSetShared {
                inner: RwLock::new(TimerSetInner {
                    timers: BTreeMap::new(),
                    tickled: false,
                    previous_ms: clock::monotonic64(),
                }),
                notify: Mutex::new(None),
            }),
        }
    }

    /// Install the front-insertion notifier. The I/O scheduler uses this to
    /// interrupt an epoll wait whose timeout just became stale.
    pub(crate) fn set_notifier(&self, notify: Box<dyn Fn() + Send + Sync>) {
        *self.shared.notify.lock().unwrap() = Some(notify);
    }

    /// Insert a timer due in `ms` milliseconds.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_inner(ms, Arc::new(cb), recurring)
    }

    /// Insert a timer whose callback only fires while `cond` still resolves.
    pub fn add_condition_timer<F, T>(&self, ms: u64, cb: F, cond: Weak<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn add_timer_inner(&self, ms: u64, cb: TimerCb, recurring: bool) -> Timer {
        let inner = Arc::new(TimerInner {
            id: TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(ms),
            deadline_ms: AtomicU64::new(clock::monotonic64() + ms),
            cb: Mutex::new(Some(cb)),
            owner: Arc::downgrade(&self.shared),
        });
        self.shared.insert(inner.clone());
        Timer { inner }
    }

    /// Milliseconds until the soonest deadline: 0 if already due, `None` if
    /// the set is empty. Clears the notification latch.
    pub fn next_timeout(&self) -> Option<u64> {
        let mut set = self.shared.inner.write().unwrap();
        set.tickled = false;
        let (deadline, _) = *set.timers.keys().next()?;
        Some(deadline.saturating_sub(clock::monotonic64()))
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.inner.read().unwrap().timers.is_empty()
    }

    /// Move every expired callback into `cbs`. Recurring timers are
    /// re-inserted at now + period; one-shot timers are cleared.
    pub(crate) fn list_expired(&self, cbs: &mut Vec<TimerCb>) {
        self.list_expired_at(clock::monotonic64(), cbs);
    }

    pub(crate) fn list_expired_at(&self, now_ms: u64, cbs: &mut Vec<TimerCb>) {
        {
            let set = self.shared.inner.read().unwrap();
            if set.timers.is_empty() {
                return;
            }
        }
        let mut set = self.shared.inner.write().unwrap();
        if set.timers.is_empty() {
            return;
        }

        let rollover = now_ms < set.previous_ms.saturating_sub(ROLLOVER_MS);
        set.previous_ms = now_ms;
        if rollover {
            log::warn!("monotonic source stepped back over an hour, firing all timers");
        } else if set.timers.keys().next().map_or(true, |k| k.0 > now_ms) {
            return;
        }

        let remaining = if rollover {
            BTreeMap::new()
        } else {
            set.timers.split_off(&(now_ms + 1, 0))
        };
        let expired = mem::replace(&mut set.timers, remaining);
        cbs.reserve(expired.len());
        for (_, timer) in expired {
            let mut cb_slot = timer.cb.lock().unwrap();
            let cb = match &*cb_slot {
                Some(cb) => cb.clone(),
                None => continue,
            };
            cbs.push(cb);
            if timer.recurring {
                drop(cb_slot);
                let deadline = now_ms + timer.period_ms.load(Ordering::SeqCst);
                timer.deadline_ms.store(deadline, Ordering::SeqCst);
                set.timers.insert(timer.key(), timer);
            } else {
                *cb_slot = None;
            }
        }
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        TimerSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn empty_set_has_no_timeout() {
        let set = TimerSet::new();
        assert_eq!(set.next_timeout(), None);
        assert!(!set.has_timer());
    }

    #[test]
    fn next_timeout_tracks_soonest() {
        let set = TimerSet::new();
        let _slow = set.add_timer(60_000, || {}, false);
        let _fast = set.add_timer(10, || {}, false);
        let next = set.next_timeout().unwrap();
        assert!(next <= 10, "next timeout {} too far out", next);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let set = TimerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let timer = set.add_timer(5, move || {
            h.fetch_add(1, Ordering::SeqCst);
        }, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());

        let mut cbs = Vec::new();
        set.list_expired_at(clock::monotonic64() + 1000, &mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recurring_timer_reinserts() {
        let set = TimerSet::new();
        let mut cbs = Vec::new();

        let _timer = set.add_timer(10, || {}, true);
        set.list_expired_at(clock::monotonic64() + 20, &mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(set.has_timer(), "recurring timer must stay in the set");

        cbs.clear();
        let one_shot = TimerSet::new();
        let _timer = one_shot.add_timer(10, || {}, false);
        one_shot.list_expired_at(clock::monotonic64() + 20, &mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(!one_shot.has_timer());
    }

    #[test]
    fn clock_rollback_fires_everything() {
        let set = TimerSet::new();
        let _far = set.add_timer(10 * 60 * 1000, || {}, false);
        let now = clock::monotonic64();

        let mut cbs = Vec::new();
        set.list_expired_at(now, &mut cbs);
        assert!(cbs.is_empty());

        // A backstep beyond the tolerance window expires everything.
        set.list_expired_at(now.saturating_sub(2 * ROLLOVER_MS), &mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(!set.has_timer());
    }

    #[test]
    fn condition_timer_skips_dead_witness() {
        let set = TimerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let witness = Arc::new(());
        let h = hits.clone();
        let _live = set.add_condition_timer(
            5,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&witness),
            false,
        );

        let dead_witness = Arc::new(());
        let weak = Arc::downgrade(&dead_witness);
        drop(dead_witness);
        let h = hits.clone();
        let _stale = set.add_condition_timer(
            5,
            move || {
                h.fetch_add(100, Ordering::SeqCst);
            },
            weak,
            false,
        );

        let mut cbs = Vec::new();
        set.list_expired_at(clock::monotonic64() + 50, &mut cbs);
        assert_eq!(cbs.len(), 2);
        for cb in &cbs {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_from_now_reseats_deadline() {
        let set = TimerSet::new();
        let timer = set.add_timer(5, || {}, false);
        assert!(timer.reset(60_000, true));
        let mut cbs = Vec::new();
        set.list_expired_at(clock::monotonic64() + 1000, &mut cbs);
        assert!(cbs.is_empty(), "re-seated timer expired early");
    }
}
