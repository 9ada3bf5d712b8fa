//! Thin wrappers over the socket syscalls. Everything here is IPv4;
//! address conversion lives next to the calls that need it.

use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use muxio_core::error::last_errno;
use muxio_core::{kerror, kfatal};
use nix::errno::Errno;

pub(crate) fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}

pub(crate) fn from_sockaddr_in(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    )
}

/// New non-blocking close-on-exec TCP socket. Failure here means fd or
/// memory exhaustion; there is no useful recovery.
pub(crate) fn create_nonblocking_or_die() -> RawFd {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        kfatal!("socket: {}", last_errno());
    }
    fd
}

pub(crate) fn bind_or_die(fd: RawFd, addr: SocketAddrV4) {
    let sin = to_sockaddr_in(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        kfatal!("bind {}: {}", addr, last_errno());
    }
}

pub(crate) fn listen_or_die(fd: RawFd) {
    if unsafe { libc::listen(fd, libc::SOMAXCONN) } < 0 {
        kfatal!("listen: {}", last_errno());
    }
}

pub(crate) fn accept(fd: RawFd) -> Result<(RawFd, SocketAddrV4), Errno> {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let connfd = unsafe {
        libc::accept4(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if connfd < 0 {
        return Err(last_errno());
    }
    Ok((connfd, from_sockaddr_in(&sin)))
}

pub(crate) fn connect(fd: RawFd, addr: SocketAddrV4) -> Result<(), Errno> {
    let sin = to_sockaddr_in(addr);
    let rc = unsafe {
        libc::connect(
            fd,
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

pub(crate) fn write(fd: RawFd, data: &[u8]) -> Result<usize, Errno> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        Err(last_errno())
    } else {
        Ok(n as usize)
    }
}

pub(crate) fn shutdown_write(fd: RawFd) {
    if unsafe { libc::shutdown(fd, libc::SHUT_WR) } < 0 {
        kerror!("shutdown(SHUT_WR) fd {}: {}", fd, last_errno());
    }
}

pub(crate) fn close(fd: RawFd) {
    if unsafe { libc::close(fd) } < 0 {
        kerror!("close fd {}: {}", fd, last_errno());
    }
}

pub(crate) fn local_addr(fd: RawFd) -> SocketAddrV4 {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        kerror!("getsockname fd {}: {}", fd, last_errno());
    }
    from_sockaddr_in(&sin)
}

pub(crate) fn peer_addr(fd: RawFd) -> SocketAddrV4 {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(
            fd,
            &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if rc < 0 {
        kerror!("getpeername fd {}: {}", fd, last_errno());
    }
    from_sockaddr_in(&sin)
}

/// Pending error on the socket, consumed by reading `SO_ERROR`.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        last_errno() as i32
    } else {
        err
    }
}

/// A connect that raced with an ephemeral-port reuse can connect to
/// itself; the caller should retry on a fresh socket.
pub(crate) fn is_self_connect(fd: RawFd) -> bool {
    let local = local_addr(fd);
    let peer = peer_addr(fd);
    local == peer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_roundtrip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 42), 8080);
        assert_eq!(from_sockaddr_in(&to_sockaddr_in(addr)), addr);
    }

    #[test]
    fn test_sockaddr_byte_order() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 80);
        let sin = to_sockaddr_in(addr);
        assert_eq!(sin.sin_port, 80u16.to_be());
        assert_eq!(sin.sin_addr.s_addr, 0x7f000001u32.to_be());
    }
}
