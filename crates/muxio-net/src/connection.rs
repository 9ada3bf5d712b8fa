//! One established TCP connection. Owns the fd, the channel, and both
//! buffers; confined to the event loop it was born on.
//!
//! Lifetime: the creator (`TcpServer`/`TcpClient`) keeps the strong
//! `Rc`; the channel holds only weak references plus a `tie` that pins
//! the connection for the duration of a dispatch. `connect_destroyed` is
//! always the last act, queued rather than called so the channel is off
//! the stack when it runs.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use muxio_core::{kdebug, kerror, ktrace, kwarn, Buffer, Timestamp};
use muxio_reactor::{Channel, EventLoop, LoopHandle};
use nix::errno::Errno;

use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConnectionPtr, WriteCompleteCallback,
};
use crate::socket::Socket;
use crate::sockets;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub struct TcpConnection {
    event_loop: Rc<EventLoop>,
    name: String,
    state: Cell<ConnState>,
    socket: Socket,
    channel: Channel,
    local_addr: SocketAddrV4,
    peer_addr: SocketAddrV4,
    connection_cb: RefCell<Option<ConnectionCallback>>,
    message_cb: RefCell<Option<MessageCallback>>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    high_water_cb: RefCell<Option<HighWaterMarkCallback>>,
    close_cb: RefCell<Option<CloseCallback>>,
    high_water_mark: Cell<usize>,
    input: RefCell<Buffer>,
    output: RefCell<Buffer>,
}

impl TcpConnection {
    pub fn new(
        event_loop: &Rc<EventLoop>,
        name: String,
        fd: RawFd,
        local_addr: SocketAddrV4,
        peer_addr: SocketAddrV4,
    ) -> TcpConnectionPtr {
        let socket = Socket::new(fd);
        socket.set_keep_alive(true);
        let channel = Channel::new(event_loop, fd);
        let conn = Rc::new(TcpConnection {
            event_loop: event_loop.clone(),
            name,
            state: Cell::new(ConnState::Connecting),
            socket,
            channel,
            local_addr,
            peer_addr,
            connection_cb: RefCell::new(None),
            message_cb: RefCell::new(None),
            write_complete_cb: RefCell::new(None),
            high_water_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
            input: RefCell::new(Buffer::new()),
            output: RefCell::new(Buffer::new()),
        });
        kdebug!("TcpConnection::new [{}] fd {}", conn.name, fd);

        let weak = Rc::downgrade(&conn);
        conn.channel.set_read_callback({
            let weak = weak.clone();
            move |receive_time| {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_read(&conn, receive_time);
                }
            }
        });
        conn.channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_write(&conn);
                }
            }
        });
        conn.channel.set_close_callback({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_close(&conn);
                }
            }
        });
        conn.channel.set_error_callback({
            move || {
                if let Some(conn) = weak.upgrade() {
                    TcpConnection::handle_error(&conn);
                }
            }
        });
        conn.channel.dont_log_hup();
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    pub fn connected(&self) -> bool {
        self.state.get() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state.get() == ConnState::Disconnected
    }

    pub fn owner_loop(&self) -> &Rc<EventLoop> {
        &self.event_loop
    }

    pub fn loop_handle(&self) -> LoopHandle {
        self.event_loop.handle()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.borrow_mut() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.borrow_mut() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_cb.borrow_mut() = Some(cb);
        self.high_water_mark.set(mark);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.borrow_mut() = Some(cb);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    /// Bytes queued in the output buffer, not yet in the kernel.
    pub fn output_backlog(&self) -> usize {
        self.output.borrow().readable_bytes()
    }

    /// Queue `data` for sending. Loop-thread only; attempts a direct
    /// write first and falls back to the output buffer plus write
    /// interest for whatever the kernel would not take.
    pub fn send(self: &Rc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state.get() != ConnState::Connected {
            kwarn!("send on disconnected connection [{}]", self.name);
            return;
        }

        let mut written = 0usize;
        let mut fault = false;
        // Direct write only when nothing is already queued, to preserve
        // byte order.
        if !self.channel.is_writing() && self.output.borrow().readable_bytes() == 0 {
            match sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        if let Some(cb) = self.write_complete_cb.borrow().clone() {
                            let conn = self.clone();
                            self.event_loop.queue_in_loop(move || cb(&conn));
                        }
                    }
                }
                Err(Errno::EAGAIN) => {}
                Err(errno) => {
                    kerror!("write [{}]: {}", self.name, errno);
                    if errno == Errno::EPIPE || errno == Errno::ECONNRESET {
                        fault = true;
                    }
                }
            }
        }

        if fault || written == data.len() {
            return;
        }

        let remaining = &data[written..];
        let old_len = self.output.borrow().readable_bytes();
        let new_len = old_len + remaining.len();
        let mark = self.high_water_mark.get();
        if new_len >= mark && old_len < mark {
            if let Some(cb) = self.high_water_cb.borrow().clone() {
                let conn = self.clone();
                self.event_loop.queue_in_loop(move || cb(&conn, new_len));
            }
        }
        self.output.borrow_mut().append(remaining);
        if !self.channel.is_writing() {
            self.channel.enable_writing();
        }
    }

    /// Close the write half once the output buffer drains. The read half
    /// stays open until the peer closes.
    pub fn shutdown(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state.get() == ConnState::Connected {
            self.state.set(ConnState::Disconnecting);
            if !self.channel.is_writing() {
                self.socket.shutdown_write();
            }
        }
    }

    /// Drop the connection without waiting for the output buffer.
    pub fn force_close(self: &Rc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if matches!(
            self.state.get(),
            ConnState::Connected | ConnState::Disconnecting
        ) {
            self.state.set(ConnState::Disconnecting);
            let conn = self.clone();
            self.event_loop.queue_in_loop(move || {
                if matches!(
                    conn.state.get(),
                    ConnState::Connected | ConnState::Disconnecting
                ) {
                    TcpConnection::handle_close(&conn);
                }
            });
        }
    }

    /// Called exactly once by the creator, on the loop thread, after the
    /// connection is fully wired.
    pub fn connect_established(conn: &TcpConnectionPtr) {
        conn.event_loop.assert_in_loop_thread();
        assert_eq!(conn.state.get(), ConnState::Connecting);
        conn.state.set(ConnState::Connected);
        let as_any: Rc<dyn Any> = conn.clone();
        conn.channel.tie(&as_any);
        conn.channel.enable_reading();
        if let Some(cb) = conn.connection_cb.borrow().clone() {
            cb(conn);
        }
    }

    /// Called exactly once by the creator as the very last step; safe to
    /// call whether or not `handle_close` already ran.
    pub fn connect_destroyed(conn: &TcpConnectionPtr) {
        conn.event_loop.assert_in_loop_thread();
        if conn.state.get() == ConnState::Connected {
            conn.state.set(ConnState::Disconnected);
            conn.channel.disable_all();
            if let Some(cb) = conn.connection_cb.borrow().clone() {
                cb(conn);
            }
        }
        conn.channel.remove();
    }

    fn handle_read(conn: &TcpConnectionPtr, receive_time: Timestamp) {
        conn.event_loop.assert_in_loop_thread();
        let result = conn.input.borrow_mut().read_fd(conn.channel.fd());
        match result {
            Ok(0) => TcpConnection::handle_close(conn),
            Ok(_) => {
                if let Some(cb) = conn.message_cb.borrow().clone() {
                    cb(conn, &mut conn.input.borrow_mut(), receive_time);
                }
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(errno) => {
                kerror!("read [{}]: {}", conn.name, errno);
                TcpConnection::handle_error(conn);
            }
        }
    }

    fn handle_write(conn: &TcpConnectionPtr) {
        conn.event_loop.assert_in_loop_thread();
        if !conn.channel.is_writing() {
            ktrace!("connection [{}] is down, no more writing", conn.name);
            return;
        }
        let write_result = {
            let output = conn.output.borrow();
            sockets::write(conn.channel.fd(), output.peek())
        };
        match write_result {
            Ok(n) => {
                let drained = {
                    let mut output = conn.output.borrow_mut();
                    // n never exceeds what peek() offered.
                    let _ = output.retrieve(n);
                    output.readable_bytes() == 0
                };
                if drained {
                    conn.channel.disable_writing();
                    if let Some(cb) = conn.write_complete_cb.borrow().clone() {
                        let queued = conn.clone();
                        conn.event_loop.queue_in_loop(move || cb(&queued));
                    }
                    if conn.state.get() == ConnState::Disconnecting {
                        conn.socket.shutdown_write();
                    }
                }
            }
            Err(Errno::EAGAIN) => {}
            Err(errno) => kerror!("handle_write [{}]: {}", conn.name, errno),
        }
    }

    fn handle_close(conn: &TcpConnectionPtr) {
        conn.event_loop.assert_in_loop_thread();
        ktrace!(
            "handle_close [{}] state {:?}",
            conn.name,
            conn.state.get()
        );
        assert!(matches!(
            conn.state.get(),
            ConnState::Connected | ConnState::Disconnecting
        ));
        conn.state.set(ConnState::Disconnected);
        conn.channel.disable_all();
        if let Some(cb) = conn.connection_cb.borrow().clone() {
            cb(conn);
        }
        let close_cb = conn.close_cb.borrow_mut().take();
        if let Some(cb) = close_cb {
            cb(conn);
        }
    }

    fn handle_error(conn: &TcpConnectionPtr) {
        let err = sockets::socket_error(conn.channel.fd());
        kerror!(
            "handle_error [{}] SO_ERROR = {} ({})",
            conn.name,
            err,
            Errno::from_raw(err)
        );
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        kdebug!(
            "TcpConnection::drop [{}] state {:?}",
            self.name,
            self.state.get()
        );
    }
}
