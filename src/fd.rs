//! Process-wide descriptor registry.
//!
//! The hook layer keys every decision off an [`FdContext`]: is this fd a
//! socket the framework manages, did the *user* ask for non-blocking mode
//! (as opposed to the `O_NONBLOCK` the framework itself sets on every
//! managed socket), and what send/recv timeouts apply. Descriptors the
//! registry has never seen (inherited, `dup`'ed, opened behind our back)
//! simply have no entry and keep raw blocking semantics.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

/// Which of the two per-socket timeouts applies to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Sentinel for "no timeout configured".
const TIMEOUT_INFINITE: u64 = u64::MAX;

////////////////////////////////////////////////////////////////////////////////
// FdContext
////////////////////////////////////////////////////////////////////////////////

/// Cached state for one open descriptor.
pub struct FdContext {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdContext {
    /// Probes the descriptor: sockets are switched to `O_NONBLOCK`
    /// (recorded as *system* non-blocking, the user-visible flag stays
    /// off), everything else is left untouched.
    fn new(fd: RawFd) -> FdContext {
        let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        FdContext {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(TIMEOUT_INFINITE),
            send_timeout_ms: AtomicU64::new(TIMEOUT_INFINITE),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether the framework put the descriptor into `O_NONBLOCK`.
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    /// Whether the *user* asked for non-blocking mode; managed sockets
    /// with this flag set bypass the parking machinery entirely.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub(crate) fn set_user_nonblock(&self, value: bool) {
        self.user_nonblock.store(value, Ordering::SeqCst);
    }

    pub fn timeout_ms(&self, kind: TimeoutKind) -> Option<u64> {
        let raw = self.timeout_cell(kind).load(Ordering::SeqCst);
        if raw == TIMEOUT_INFINITE {
            None
        } else {
            Some(raw)
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, timeout: Option<u64>) {
        self.timeout_cell(kind)
            .store(timeout.unwrap_or(TIMEOUT_INFINITE), Ordering::SeqCst);
    }

    fn timeout_cell(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout_ms,
            TimeoutKind::Send => &self.send_timeout_ms,
        }
    }
}

impl std::fmt::Debug for FdContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FdContext")
            .field("fd", &self.fd)
            .field("is_socket", &self.is_socket)
            .field("user_nonblock", &self.user_nonblock())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// FdRegistry
////////////////////////////////////////////////////////////////////////////////

/// Vector of contexts indexed by descriptor, grown ×1.5 on demand.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

impl FdRegistry {
    fn new() -> FdRegistry {
        FdRegistry {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Fetches the context for `fd`, creating and probing it when
    /// `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().expect("fd registry lock poisoned");
            match slots.get(fd as usize) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write().expect("fd registry lock poisoned");
        if fd as usize >= slots.len() {
            let want = (fd as usize * 3 / 2).max(fd as usize + 1).max(32);
            slots.resize(want, None);
        }
        if let Some(ctx) = &slots[fd as usize] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdContext::new(fd));
        slots[fd as usize] = Some(ctx.clone());
        Some(ctx)
    }

    /// Drops the entry for `fd` (on close).
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().expect("fd registry lock poisoned");
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

/// The process-global registry.
pub fn registry() -> &'static FdRegistry {
    static REGISTRY: Lazy<FdRegistry> = Lazy::new(FdRegistry::new);
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn sockets_are_detected_and_made_nonblocking() {
        let (a, b) = socketpair();
        let ctx = registry().get(a, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), None);

        let flags = unsafe { libc::fcntl(a, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        registry().remove(a);
        assert!(registry().get(a, false).is_none());
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn non_sockets_pass_through_untouched() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = registry().get(fds[0], true).unwrap();
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        registry().remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn missing_entries_require_auto_create() {
        // a descriptor number we never opened
        assert!(registry().get(1_000_000, false).is_none());
    }

    #[test]
    fn timeouts_round_trip() {
        let (a, b) = socketpair();
        let ctx = registry().get(a, true).unwrap();
        ctx.set_timeout_ms(TimeoutKind::Send, Some(250));
        assert_eq!(ctx.timeout_ms(TimeoutKind::Send), Some(250));
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), None);
        ctx.set_timeout_ms(TimeoutKind::Send, None);
        assert_eq!(ctx.timeout_ms(TimeoutKind::Send), None);

        registry().remove(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
