//! Listening socket plus its channel. Hands each accepted fd to a
//! callback; `TcpServer` wires that callback to connection setup.

use std::cell::{Cell, RefCell};
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use muxio_core::error::last_errno;
use muxio_core::{kerror, kfatal};
use muxio_reactor::{Channel, EventLoop};
use nix::errno::Errno;

use crate::socket::Socket;
use crate::sockets;

pub type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddrV4)>;

pub struct Acceptor {
    accept_socket: Socket,
    channel: Channel,
    new_connection_cb: RefCell<Option<NewConnectionCallback>>,
    listening: Cell<bool>,
    /// Reserved fd, sacrificed to drain the queue when accept(2) hits
    /// EMFILE. Without it the readable listen socket would spin the loop.
    idle_fd: Cell<RawFd>,
}

impl Acceptor {
    pub fn new(
        event_loop: &Rc<EventLoop>,
        listen_addr: SocketAddrV4,
        reuse_port: bool,
    ) -> Rc<Acceptor> {
        let idle_fd = open_idle_fd();
        let fd = sockets::create_nonblocking_or_die();
        let accept_socket = Socket::new(fd);
        accept_socket.set_reuse_addr(true);
        accept_socket.set_reuse_port(reuse_port);
        accept_socket.bind_address(listen_addr);

        let acceptor = Rc::new(Acceptor {
            accept_socket,
            channel: Channel::new(event_loop, fd),
            new_connection_cb: RefCell::new(None),
            listening: Cell::new(false),
            idle_fd: Cell::new(idle_fd),
        });
        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        acceptor
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.borrow_mut() = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    pub fn listen(&self) {
        self.listening.set(true);
        self.accept_socket.listen();
        self.channel.enable_reading();
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        sockets::local_addr(self.accept_socket.fd())
    }

    fn handle_read(&self) {
        match self.accept_socket.accept() {
            Ok((connfd, peer_addr)) => {
                let mut cb = self.new_connection_cb.borrow_mut();
                match cb.as_mut() {
                    Some(cb) => cb(connfd, peer_addr),
                    None => sockets::close(connfd),
                }
            }
            Err(Errno::EMFILE) => {
                // Accept on the reserved fd, close immediately, reserve
                // again. The peer sees a clean close instead of a hang.
                kerror!("accept: out of file descriptors");
                sockets::close(self.idle_fd.get());
                let drained =
                    unsafe { libc::accept(self.accept_socket.fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
                if drained >= 0 {
                    sockets::close(drained);
                }
                self.idle_fd.set(open_idle_fd());
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(errno) => kerror!("accept: {}", errno),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
        sockets::close(self.idle_fd.get());
    }
}

fn open_idle_fd() -> RawFd {
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        kfatal!("open /dev/null: {}", last_errno());
    }
    fd
}
