//! Cooperative TCP streams and listeners.
//!
//! Thin wrappers over the [hooked syscalls](crate::hook): on a reactor
//! worker, `accept`/`read`/`write`/`connect` suspend the calling fiber
//! instead of blocking the thread; anywhere else they behave like their
//! blocking std counterparts. Per-stream timeouts are stored in the fd
//! context and picked up by the hook layer on every operation.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::raw::c_void;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::fd::{self, TimeoutKind};
use crate::hook;
use crate::util;

////////////////////////////////////////////////////////////////////////////////
// sockaddr conversions
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage = unsafe { std::mem::zeroed::<libc::sockaddr_storage>() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                };
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

pub(crate) fn sockaddr_to(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::from((
                u32::from_be(sin.sin_addr.s_addr).to_be_bytes(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::from((
                sin6.sin6_addr.s6_addr,
                u16::from_be(sin6.sin6_port),
            )))
        }
        _ => None,
    }
}

fn domain_of(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

/// These types are cooperative by definition, so their sockets always
/// join the registry (and turn non-blocking), hook flag or not.
fn new_managed_socket(addr: &SocketAddr) -> io::Result<RawFd> {
    let fd = hook::socket(domain_of(addr), libc::SOCK_STREAM, 0)?;
    fd::registry().get(fd, true);
    Ok(fd)
}

fn local_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage = unsafe { std::mem::zeroed::<libc::sockaddr_storage>() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    util::cvt(unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    sockaddr_to(&storage, len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unsupported address family"))
}

fn peer_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage = unsafe { std::mem::zeroed::<libc::sockaddr_storage>() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    util::cvt(unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    })?;
    sockaddr_to(&storage, len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unsupported address family"))
}

////////////////////////////////////////////////////////////////////////////////
// CoTcpStream
////////////////////////////////////////////////////////////////////////////////

/// A TCP stream whose blocking operations park the calling fiber.
pub struct CoTcpStream {
    fd: RawFd,
}

impl CoTcpStream {
    /// Connects to the first resolvable address, using the configured
    /// `tcp.connect.timeout`.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<CoTcpStream> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            let fd = new_managed_socket(&addr)?;
            match hook::connect(fd, &addr) {
                Ok(()) => return Ok(CoTcpStream { fd }),
                Err(e) => {
                    let _ = hook::close(fd);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")
        }))
    }

    /// Connects with an explicit timeout instead of the configured one.
    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> io::Result<CoTcpStream> {
        let fd = new_managed_socket(addr)?;
        match hook::connect_with_timeout(fd, addr, Some(timeout.as_millis() as u64)) {
            Ok(()) => Ok(CoTcpStream { fd }),
            Err(e) => {
                let _ = hook::close(fd);
                Err(e)
            }
        }
    }

    /// Adopts an already-connected descriptor (e.g. from `accept`).
    pub(crate) fn from_fd(fd: RawFd) -> CoTcpStream {
        CoTcpStream { fd }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr_of(self.fd)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        peer_addr_of(self.fd)
    }

    /// Read timeout for subsequent operations; `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        if let Some(ctx) = fd::registry().get(self.fd, true) {
            ctx.set_timeout_ms(TimeoutKind::Recv, timeout.map(|t| t.as_millis() as u64));
        }
    }

    /// Write timeout for subsequent operations; `None` waits forever.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        if let Some(ctx) = fd::registry().get(self.fd, true) {
            ctx.set_timeout_ms(TimeoutKind::Send, timeout.map(|t| t.as_millis() as u64));
        }
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        let how = match how {
            std::net::Shutdown::Read => libc::SHUT_RD,
            std::net::Shutdown::Write => libc::SHUT_WR,
            std::net::Shutdown::Both => libc::SHUT_RDWR,
        };
        util::cvt(unsafe { libc::shutdown(self.fd, how) }).map(drop)
    }
}

impl Read for CoTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        hook::read(self.fd, buf)
    }
}

impl Write for CoTcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        hook::write(self.fd, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for CoTcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoTcpStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for CoTcpStream {
    fn drop(&mut self) {
        let _ = hook::close(self.fd);
    }
}

impl std::fmt::Debug for CoTcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CoTcpStream").field("fd", &self.fd).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoTcpListener
////////////////////////////////////////////////////////////////////////////////

/// A TCP listener whose `accept` parks the calling fiber.
pub struct CoTcpListener {
    fd: RawFd,
}

impl CoTcpListener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<CoTcpListener> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match Self::bind_one(&addr) {
                Ok(listener) => return Ok(listener),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no addresses to bind to")
        }))
    }

    fn bind_one(addr: &SocketAddr) -> io::Result<CoTcpListener> {
        let fd = new_managed_socket(addr)?;
        let listener = CoTcpListener { fd };

        let one: libc::c_int = 1;
        util::cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;

        let (storage, len) = sockaddr_from(addr);
        util::cvt(unsafe {
            libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len)
        })?;
        util::cvt(unsafe { libc::listen(fd, libc::SOMAXCONN) })?;
        Ok(listener)
    }

    /// Waits for the next connection, yielding the calling fiber.
    pub fn accept(&self) -> io::Result<(CoTcpStream, SocketAddr)> {
        let fd = hook::accept(self.fd)?;
        let stream = CoTcpStream::from_fd(fd);
        let peer = stream.peer_addr()?;
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        local_addr_of(self.fd)
    }
}

impl AsRawFd for CoTcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoTcpListener {
    fn drop(&mut self) {
        let _ = hook::close(self.fd);
    }
}

impl std::fmt::Debug for CoTcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CoTcpListener").field("fd", &self.fd).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trips() {
        for text in &["127.0.0.1:8020", "[::1]:9999", "10.255.255.1:80"] {
            let addr: SocketAddr = text.parse().unwrap();
            let (storage, len) = sockaddr_from(&addr);
            assert_eq!(sockaddr_to(&storage, len), Some(addr));
        }
    }
}
