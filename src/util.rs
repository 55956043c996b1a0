//! Small OS helpers shared across the crate.

use std::io;

/// Kernel id of the calling thread.
///
/// This is the id the scheduler uses for task affinity, matching what the
/// kernel shows in `/proc/<pid>/task`. Unlike [`std::thread::ThreadId`] it
/// can be compared against ids observed from other processes or tools.
#[inline(always)]
pub fn thread_id() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// The calling thread's current `errno` value.
#[inline(always)]
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Converts a `-1`-style libc return into an `io::Result`.
#[inline(always)]
pub(crate) fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_differ_across_threads() {
        let here = thread_id();
        assert!(here > 0);
        let there = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
