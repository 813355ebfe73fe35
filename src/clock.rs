//! Monotonic clock helpers.
//!
//! All deadlines in the runtime are absolute monotonic milliseconds; the
//! timer set and the hooked timeouts never look at the wall clock.
use std::mem::MaybeUninit;

#[inline(always)]
pub fn monotonic() -> f64 {
    let ts = timespec(libc::CLOCK_MONOTONIC);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// Monotonic time in milliseconds.
#[inline(always)]
pub fn monotonic64() -> u64 {
    let ts = timespec(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[inline(always)]
fn timespec(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let rc = unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) };
    assert_eq!(rc, 0, "clock_gettime failed");
    unsafe { ts.assume_init() }
}
