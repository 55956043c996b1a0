//! Blocking-call interceptors.
//!
//! Every entry point here mirrors a libc call. A thread-local flag decides
//! what happens: with the hook disabled (the default; only reactor
//! workers enable it) each function forwards to the raw syscall verbatim.
//! With it enabled, a call on a framework-managed socket that would block
//! instead registers interest with the current [`Reactor`], optionally
//! arms a timeout timer racing the event, and parks the calling fiber.
//! On wakeup the syscall is retried; a timeout surfaces as `ETIMEDOUT`,
//! exactly as a kernel-level socket timeout would.
//!
//! Descriptors without an [`FdContext`](crate::fd::FdContext) entry
//! (inherited fds, plain files, anything opened behind the registry's
//! back) always take the raw path.
//!
//! The sleep family never busy-waits a worker: it converts the delay into
//! a one-shot timer that reschedules the calling fiber.

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config;
use crate::error::Error;
use crate::fd::{self, TimeoutKind};
use crate::fiber::{self, Fiber};
use crate::net;
use crate::reactor::{Event, Reactor};
use crate::util;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether hooked calls on this thread take the fiber-parking path.
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|flag| flag.get())
}

/// Flips the per-thread hook flag. Reactor workers enable it on loop
/// entry; everything else keeps pass-through behavior.
pub fn set_enabled(enabled: bool) {
    HOOK_ENABLED.with(|flag| flag.set(enabled));
}

/// `u64::MAX` in the config means "no timeout".
static CONNECT_TIMEOUT_MS: Lazy<Arc<AtomicU64>> = Lazy::new(|| {
    let cell = Arc::new(AtomicU64::new(5000));
    let var = config::lookup::<u64>("tcp.connect.timeout", 5000, "tcp connect timeout (ms)");
    cell.store(var.value(), Ordering::SeqCst);
    let updated = cell.clone();
    var.add_listener(move |old, new| {
        log::info!("tcp connect timeout changed from {} to {}", old, new);
        updated.store(*new, Ordering::SeqCst);
    });
    cell
});

fn default_connect_timeout() -> Option<u64> {
    match CONNECT_TIMEOUT_MS.load(Ordering::SeqCst) {
        u64::MAX => None,
        ms => Some(ms),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sleep family
////////////////////////////////////////////////////////////////////////////////

/// Hooked `sleep(3)`; returns 0 on a fiber wakeup.
pub fn sleep(seconds: u32) -> u32 {
    if !is_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

/// Hooked `usleep(3)`.
pub fn usleep(usec: libc::useconds_t) -> libc::c_int {
    if !is_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_ms(usec as u64 / 1000);
    0
}

/// Hooked `nanosleep(2)` (no remainder reporting: a fiber wakeup never
/// leaves the sleep early).
pub fn nanosleep(req: Duration) -> libc::c_int {
    if !is_enabled() {
        let ts = libc::timespec {
            tv_sec: req.as_secs() as libc::time_t,
            tv_nsec: req.subsec_nanos() as libc::c_long,
        };
        return unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
    }
    sleep_ms(req.as_millis() as u64);
    0
}

fn sleep_ms(ms: u64) {
    let reactor = Reactor::current().expect("hooked sleep outside of a reactor worker");
    let cur = Fiber::current();
    let weak = Arc::downgrade(&reactor);
    reactor.timers().add_timer(
        ms,
        move || {
            if let Some(reactor) = weak.upgrade() {
                reactor.schedule_fiber(cur.clone());
            }
        },
        false,
    );
    fiber::yield_to_hold();
}

////////////////////////////////////////////////////////////////////////////////
// do_io
////////////////////////////////////////////////////////////////////////////////

#[inline]
fn ret(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// The shared retry/park/timeout engine behind every hooked I/O call.
fn do_io<F>(
    fd: RawFd,
    name: &str,
    event: Event,
    timeout_kind: TimeoutKind,
    mut raw: F,
) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    if !is_enabled() {
        return ret(raw());
    }
    let ctx = match fd::registry().get(fd, false) {
        Some(ctx) => ctx,
        None => return ret(raw()),
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return ret(raw());
    }

    let timeout = ctx.timeout_ms(timeout_kind);
    // the cancellation cell doubles as the condition-timer witness: once
    // this call returns, the late timer callback finds it gone
    let cancelled = Arc::new(AtomicI32::new(0));

    loop {
        let mut n = raw();
        while n < 0 && util::errno() == libc::EINTR {
            n = raw();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        if util::errno() != libc::EAGAIN {
            return Err(io::Error::last_os_error());
        }

        let reactor = Reactor::current().ok_or_else(|| Error::NoReactor.into_io())?;
        let timer = timeout.map(|timeout_ms| {
            let cell = Arc::downgrade(&cancelled);
            let weak = Arc::downgrade(&reactor);
            reactor.timers().add_condition_timer(
                timeout_ms,
                move || {
                    let cell = match cell.upgrade() {
                        Some(cell) => cell,
                        None => return,
                    };
                    if cell.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    cell.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    if let Some(reactor) = weak.upgrade() {
                        reactor.cancel_event(fd, event);
                    }
                },
                Arc::downgrade(&cancelled),
                false,
            )
        });

        if let Err(e) = reactor.add_event(fd, event, None) {
            log::error!("{}: add_event({}, {:?}) failed: {}", name, fd, event, e);
            if let Some(timer) = &timer {
                reactor.timers().cancel(timer);
            }
            return Err(e.into_io());
        }

        fiber::yield_to_hold();

        if let Some(timer) = &timer {
            reactor.timers().cancel(timer);
        }
        let rc = cancelled.load(Ordering::SeqCst);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        // the event fired: retry the syscall
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sockets
////////////////////////////////////////////////////////////////////////////////

/// Hooked `socket(2)`; managed sockets get a registry entry (and thereby
/// `O_NONBLOCK`).
pub fn socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> io::Result<RawFd> {
    let fd = util::cvt(unsafe { libc::socket(domain, ty, protocol) })?;
    if is_enabled() {
        fd::registry().get(fd, true);
    }
    Ok(fd)
}

/// Hooked `connect(2)` with the configured default timeout.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, default_connect_timeout())
}

/// Hooked `connect(2)` racing an explicit timeout.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: &SocketAddr,
    timeout_ms: Option<u64>,
) -> io::Result<()> {
    let (storage, len) = net::sockaddr_from(addr);
    let raw = || unsafe {
        libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
    };

    if !is_enabled() {
        return util::cvt(raw()).map(drop);
    }
    let ctx = match fd::registry().get(fd, false) {
        Some(ctx) => ctx,
        None => return util::cvt(raw()).map(drop),
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return util::cvt(raw()).map(drop);
    }

    if raw() == 0 {
        return Ok(());
    }
    if util::errno() != libc::EINPROGRESS {
        return Err(io::Error::last_os_error());
    }

    let reactor = Reactor::current().ok_or_else(|| Error::NoReactor.into_io())?;
    let cancelled = Arc::new(AtomicI32::new(0));
    let timer = timeout_ms.map(|timeout_ms| {
        let cell = Arc::downgrade(&cancelled);
        let weak = Arc::downgrade(&reactor);
        reactor.timers().add_condition_timer(
            timeout_ms,
            move || {
                let cell = match cell.upgrade() {
                    Some(cell) => cell,
                    None => return,
                };
                if cell.load(Ordering::SeqCst) != 0 {
                    return;
                }
                cell.store(libc::ETIMEDOUT, Ordering::SeqCst);
                if let Some(reactor) = weak.upgrade() {
                    reactor.cancel_event(fd, Event::WRITE);
                }
            },
            Arc::downgrade(&cancelled),
            false,
        )
    });

    match reactor.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            fiber::yield_to_hold();
            if let Some(timer) = &timer {
                reactor.timers().cancel(timer);
            }
            let rc = cancelled.load(Ordering::SeqCst);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
        }
        Err(e) => {
            if let Some(timer) = &timer {
                reactor.timers().cancel(timer);
            }
            log::error!("connect: add_event({}, WRITE) failed: {}", fd, e);
            return Err(e.into_io());
        }
    }

    // the wait ended without a timeout: ask the kernel how the handshake
    // actually went
    let mut err: libc::c_int = 0;
    let mut err_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    util::cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut err_len,
        )
    })?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// Hooked `accept(2)`; the accepted socket joins the registry.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let n = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as libc::ssize_t
    })?;
    let accepted = n as RawFd;
    fd::registry().get(accepted, true);
    Ok(accepted)
}

////////////////////////////////////////////////////////////////////////////////
// Read side
////////////////////////////////////////////////////////////////////////////////

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(
            fd,
            bufs.as_mut_ptr() as *mut libc::iovec,
            bufs.len() as libc::c_int,
        )
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: libc::c_int,
) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage = unsafe { std::mem::zeroed::<libc::sockaddr_storage>() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    })?;
    Ok((n, net::sockaddr_to(&storage, addr_len)))
}

/// Hooked `recvmsg(2)`.
///
/// # Safety
///
/// `msg` must point to a valid `msghdr` whose buffers stay alive for the
/// duration of the call (including across the fiber suspension).
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || {
        libc::recvmsg(fd, msg, flags)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Write side
////////////////////////////////////////////////////////////////////////////////

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(
            fd,
            bufs.as_ptr() as *const libc::iovec,
            bufs.len() as libc::c_int,
        )
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: libc::c_int) -> io::Result<usize> {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

pub fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: libc::c_int,
    addr: &SocketAddr,
) -> io::Result<usize> {
    let (storage, len) = net::sockaddr_from(addr);
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            flags,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    })
}

/// Hooked `sendmsg(2)`.
///
/// # Safety
///
/// `msg` must point to a valid `msghdr` whose buffers stay alive for the
/// duration of the call (including across the fiber suspension).
pub unsafe fn sendmsg(
    fd: RawFd,
    msg: *const libc::msghdr,
    flags: libc::c_int,
) -> io::Result<usize> {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || {
        libc::sendmsg(fd, msg, flags)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Bookkeeping hooks
////////////////////////////////////////////////////////////////////////////////

/// Hooked `close(2)`: fires any parked events and evicts the registry
/// entry before closing.
pub fn close(fd: RawFd) -> io::Result<()> {
    if is_enabled() {
        if let Some(ctx) = fd::registry().get(fd, false) {
            ctx.set_closed();
            if let Some(reactor) = Reactor::current() {
                reactor.cancel_all(fd);
            }
            fd::registry().remove(fd);
        }
    }
    util::cvt(unsafe { libc::close(fd) }).map(drop)
}

/// Hooked `fcntl(2)` for the int-argument commands.
///
/// `F_SETFL` records the user's `O_NONBLOCK` intent in the fd context
/// while the kernel flag stays under framework control; `F_GETFL` reports
/// the flag the user asked for, not the one the kernel has.
pub fn fcntl(fd: RawFd, cmd: libc::c_int, arg: libc::c_int) -> libc::c_int {
    match cmd {
        libc::F_SETFL => {
            match fd::registry().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    let mut arg = arg;
                    if ctx.sys_nonblock() {
                        arg |= libc::O_NONBLOCK;
                    } else {
                        arg &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, cmd, arg) }
                }
                _ => unsafe { libc::fcntl(fd, cmd, arg) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags < 0 {
                return flags;
            }
            match fd::registry().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// Hooked `ioctl(2)`: `FIONBIO` records user intent like `F_SETFL`.
///
/// # Safety
///
/// `arg` must be valid for the given `request`, as with raw `ioctl`.
pub unsafe fn ioctl(fd: RawFd, request: libc::c_ulong, arg: *mut c_void) -> libc::c_int {
    if request == libc::FIONBIO {
        let user_nonblock = *(arg as *mut libc::c_int) != 0;
        if let Some(ctx) = fd::registry().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// Hooked `getsockopt(2)`: plain pass-through.
///
/// # Safety
///
/// As with raw `getsockopt`: `optval`/`optlen` must be valid.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *mut c_void,
    optlen: *mut libc::socklen_t,
) -> libc::c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// Hooked `setsockopt(2)`: `SO_RCVTIMEO`/`SO_SNDTIMEO` are recorded in
/// the fd context (where `do_io` reads them) instead of being burned into
/// the kernel socket.
///
/// # Safety
///
/// As with raw `setsockopt`: `optval` must point to `optlen` valid bytes.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> libc::c_int {
    if is_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = fd::registry().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout_ms(kind, if ms == 0 { None } else { Some(ms) });
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_hook_passes_through() {
        assert!(!is_enabled());
        // read on a plain pipe must behave exactly like libc::read
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(unsafe { libc::write(fds[1], b"x".as_ptr() as *const c_void, 1) }, 1);
        let mut buf = [0u8; 4];
        assert_eq!(read(fds[0], &mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'x');
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn fcntl_reports_the_user_intended_flag() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        // register as a managed socket: kernel flag goes nonblocking
        fd::registry().get(fds[0], true).unwrap();

        // the user never asked for O_NONBLOCK, so F_GETFL must hide it
        assert_eq!(fcntl(fds[0], libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);

        // now the user opts in; the visible flag follows the request
        let flags = fcntl(fds[0], libc::F_GETFL, 0);
        fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        assert_ne!(fcntl(fds[0], libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);
        let ctx = fd::registry().get(fds[0], false).unwrap();
        assert!(ctx.user_nonblock());

        fd::registry().remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn setsockopt_records_timeouts_in_the_context() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let ctx = fd::registry().get(fds[0], true).unwrap();

        set_enabled(true);
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        let rc = unsafe {
            setsockopt(
                fds[0],
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        set_enabled(false);
        assert_eq!(rc, 0);
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), Some(1500));

        fd::registry().remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
