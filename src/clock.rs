//! Millisecond clocks derived from the Posix `clock_gettime` function.
//!
//! Timers and timeouts throughout the crate are expressed in milliseconds
//! on the monotonic clock; [`now_ms`] is the single source of "now". The
//! wall clock is exposed only for log-friendly timestamps, it never drives
//! scheduling.

use std::mem::MaybeUninit;

#[inline]
fn gettime(which: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // clock_gettime can only fail for an invalid clock id
    let rc = unsafe { libc::clock_gettime(which, ts.as_mut_ptr()) };
    debug_assert_eq!(rc, 0);
    unsafe { ts.assume_init() }
}

/// Monotonic time in milliseconds since an unspecified epoch.
#[inline(always)]
pub fn now_ms() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// Monotonic time in microseconds since an unspecified epoch.
#[inline(always)]
pub fn now_us() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Wall clock time in milliseconds since the Unix epoch.
#[inline(always)]
pub fn realtime_ms() -> u64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);

        let a = now_us();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_us();
        assert!(b > a);
    }
}
