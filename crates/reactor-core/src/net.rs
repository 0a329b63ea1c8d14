//! Raw, non-blocking IPv4 socket plumbing built directly on `libc`.
//!
//! This module is Linux-only: it leans on `accept4`, `eventfd` and the
//! level-triggered `epoll` family exactly as the reactor above it does, so
//! there is no portable fallback path to maintain.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? )) => {{
        let res = unsafe { libc::$fn($($arg),*) };
        if res == -1 { Err(std::io::Error::last_os_error()) } else { Ok(res) }
    }};
}

/// Converts a `SocketAddrV4` into its `libc::sockaddr_in` wire form.
///
/// `sin_addr`/`sin_port` are filled byte-for-byte from the address's network
/// order representation (`Ipv4Addr::octets`, `to_be`) rather than by casting
/// pointers across the two types, so this doesn't depend on `std`'s internal
/// layout for `SocketAddrV4`.
fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) },
        sin_zero: [0; 8],
    }
}

fn from_sockaddr_in(raw: libc::sockaddr_in) -> SocketAddr {
    let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
    let port = u16::from_be(raw.sin_port);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

/// Creates a non-blocking, close-on-exec `AF_INET`/`SOCK_STREAM` socket.
pub fn new_stream_socket() -> io::Result<RawFd> {
    syscall!(socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0))
}

fn set_sockopt_bool(fd: RawFd, level: libc::c_int, name: libc::c_int, value: bool) -> io::Result<()> {
    let v: libc::c_int = value as libc::c_int;
    syscall!(setsockopt(fd, level, name, &v as *const _ as *const libc::c_void, std::mem::size_of::<libc::c_int>() as libc::socklen_t))
        .map(drop)
}

pub fn set_reuseaddr(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
}

pub fn set_reuseport(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
}

pub fn set_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
}

pub fn set_keepalive(fd: RawFd, on: bool) -> io::Result<()> {
    set_sockopt_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
}

pub fn bind(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let addr = match addr {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => return Err(io::Error::new(io::ErrorKind::InvalidInput, "IPv6 is not supported")),
    };
    let raw = to_sockaddr_in(addr);
    syscall!(bind(fd, &raw as *const _ as *const libc::sockaddr, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
        .map(drop)
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(drop)
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    syscall!(getsockname(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len))?;
    Ok(from_sockaddr_in(raw))
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    syscall!(getpeername(fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len))?;
    Ok(from_sockaddr_in(raw))
}

/// Returns the pending `SO_ERROR` on a socket, clearing it. `Ok(None)` means
/// no error is pending.
pub fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut err as *mut _ as *mut libc::c_void, &mut len))?;
    if err == 0 { Ok(None) } else { Ok(Some(io::Error::from_raw_os_error(err))) }
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR)).map(drop)
}

pub fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}

/// Outcome of a single non-blocking `accept4` call.
pub enum AcceptOutcome {
    Accepted(RawFd, SocketAddr),
    WouldBlock,
    /// Process-wide file descriptor limit reached (`EMFILE`). The listening
    /// socket stays registered; the caller should just log and move on.
    ResourceExhausted,
    Error(io::Error),
}

pub fn accept4_nonblocking(listen_fd: RawFd) -> AcceptOutcome {
    let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut raw as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd >= 0 {
        return AcceptOutcome::Accepted(fd, from_sockaddr_in(raw));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => AcceptOutcome::WouldBlock,
        Some(libc::EMFILE) | Some(libc::ENFILE) => AcceptOutcome::ResourceExhausted,
        _ => AcceptOutcome::Error(err),
    }
}

/// Creates the non-blocking `eventfd` used by an `EventLoop` to wake itself
/// from cross-thread task submission.
pub fn create_eventfd() -> io::Result<RawFd> {
    syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))
}
