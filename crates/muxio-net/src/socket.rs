//! Owning wrapper for a socket fd; closes on drop.

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;

use muxio_core::kerror;
use nix::errno::Errno;

use crate::sockets;

pub struct Socket {
    fd: RawFd,
}

impl Socket {
    pub fn new(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn bind_address(&self, addr: SocketAddrV4) {
        sockets::bind_or_die(self.fd, addr);
    }

    pub fn listen(&self) {
        sockets::listen_or_die(self.fd);
    }

    pub fn accept(&self) -> Result<(RawFd, SocketAddrV4), Errno> {
        sockets::accept(self.fd)
    }

    pub fn shutdown_write(&self) {
        sockets::shutdown_write(self.fd);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.set_int_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on, "TCP_NODELAY");
    }

    pub fn set_reuse_addr(&self, on: bool) {
        self.set_int_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on, "SO_REUSEADDR");
    }

    pub fn set_reuse_port(&self, on: bool) {
        self.set_int_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on, "SO_REUSEPORT");
    }

    pub fn set_keep_alive(&self, on: bool) {
        self.set_int_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on, "SO_KEEPALIVE");
    }

    fn set_int_opt(&self, level: libc::c_int, opt: libc::c_int, on: bool, name: &str) {
        let value: libc::c_int = if on { 1 } else { 0 };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                opt,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            kerror!(
                "setsockopt {} fd {}: {}",
                name,
                self.fd,
                muxio_core::error::last_errno()
            );
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        sockets::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_closes_on_drop() {
        let fd = sockets::create_nonblocking_or_die();
        drop(Socket::new(fd));
        // fd is gone; fcntl on it must fail with EBADF.
        let rc = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(rc, -1);
        assert_eq!(muxio_core::error::last_errno(), Errno::EBADF);
    }

    #[test]
    fn test_socket_options_apply() {
        let fd = sockets::create_nonblocking_or_die();
        let socket = Socket::new(fd);
        socket.set_reuse_addr(true);
        socket.set_keep_alive(true);

        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        assert_eq!(rc, 0);
        assert_ne!(value, 0);
    }
}
