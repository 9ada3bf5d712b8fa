//! Outbound side: `Connector` drives the non-blocking connect state
//! machine with exponential retry; `TcpClient` turns a connected fd into
//! a `TcpConnection` and optionally reconnects when it drops.

use std::cell::{Cell, RefCell};
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use muxio_core::{kdebug, kerror, kinfo, kwarn};
use muxio_reactor::{Channel, EventLoop};
use nix::errno::Errno;

use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::sockets;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns the in-flight connect attempt. A watch channel waits for the
/// socket to become writable, then `SO_ERROR` decides success, retry, or
/// self-connect.
pub struct Connector {
    event_loop: Rc<EventLoop>,
    server_addr: SocketAddrV4,
    connect: Cell<bool>,
    state: Cell<ConnectorState>,
    retry_delay: Cell<Duration>,
    channel: RefCell<Option<Channel>>,
    new_connection_cb: RefCell<Option<Box<dyn FnMut(RawFd)>>>,
}

impl Connector {
    pub fn new(event_loop: &Rc<EventLoop>, server_addr: SocketAddrV4) -> Rc<Connector> {
        Rc::new(Connector {
            event_loop: event_loop.clone(),
            server_addr,
            connect: Cell::new(false),
            state: Cell::new(ConnectorState::Disconnected),
            retry_delay: Cell::new(INIT_RETRY_DELAY),
            channel: RefCell::new(None),
            new_connection_cb: RefCell::new(None),
        })
    }

    pub fn set_new_connection_callback(&self, cb: Box<dyn FnMut(RawFd)>) {
        *self.new_connection_cb.borrow_mut() = Some(cb);
    }

    pub fn server_addr(&self) -> SocketAddrV4 {
        self.server_addr
    }

    pub fn start(self: &Rc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.connect.set(true);
        self.do_connect();
    }

    /// Give up: close any in-flight attempt and suppress pending retries.
    pub fn stop(&self) {
        self.event_loop.assert_in_loop_thread();
        self.connect.set(false);
        if self.state.get() == ConnectorState::Connecting {
            self.state.set(ConnectorState::Disconnected);
            let fd = self.take_channel();
            sockets::close(fd);
        }
    }

    /// Called after an established connection drops, to dial again from
    /// a clean slate.
    pub fn restart(self: &Rc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.state.set(ConnectorState::Disconnected);
        self.retry_delay.set(INIT_RETRY_DELAY);
        self.connect.set(true);
        self.do_connect();
    }

    fn do_connect(self: &Rc<Self>) {
        let fd = sockets::create_nonblocking_or_die();
        match sockets::connect(fd, self.server_addr) {
            Ok(())
            | Err(Errno::EINPROGRESS)
            | Err(Errno::EINTR)
            | Err(Errno::EISCONN) => self.connecting(fd),
            Err(Errno::EAGAIN)
            | Err(Errno::EADDRINUSE)
            | Err(Errno::EADDRNOTAVAIL)
            | Err(Errno::ECONNREFUSED)
            | Err(Errno::ENETUNREACH) => self.retry(fd),
            Err(errno) => {
                kerror!("connect {}: {}", self.server_addr, errno);
                sockets::close(fd);
            }
        }
    }

    fn connecting(self: &Rc<Self>, fd: RawFd) {
        self.state.set(ConnectorState::Connecting);
        let channel = Channel::new(&self.event_loop, fd);
        let weak = Rc::downgrade(self);
        channel.set_write_callback({
            let weak = weak.clone();
            move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_write();
                }
            }
        });
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });
        channel.enable_writing();
        *self.channel.borrow_mut() = Some(channel);
    }

    /// Detach and unregister the watch channel, handing back its fd. The
    /// dispatch frame keeps the channel alive until the deferred removal
    /// runs.
    fn take_channel(&self) -> RawFd {
        let channel = match self.channel.borrow_mut().take() {
            Some(channel) => channel,
            None => muxio_core::kfatal!("connector has no watch channel"),
        };
        let fd = channel.fd();
        channel.disable_all();
        channel.remove();
        fd
    }

    fn handle_write(self: &Rc<Self>) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        let fd = self.take_channel();
        let err = sockets::socket_error(fd);
        if err != 0 {
            kwarn!(
                "connect {}: SO_ERROR = {} ({})",
                self.server_addr,
                err,
                Errno::from_raw(err)
            );
            self.retry(fd);
        } else if sockets::is_self_connect(fd) {
            kwarn!("connect {}: self connect", self.server_addr);
            self.retry(fd);
        } else {
            self.state.set(ConnectorState::Connected);
            if self.connect.get() {
                // The watch channel's unregistration is deferred until
                // this dispatch frame unwinds; hand the fd over through
                // the task queue so the connection's channel never
                // re-registers the fd while the old entry is still in
                // the poller.
                let weak = Rc::downgrade(self);
                self.event_loop.queue_in_loop(move || {
                    match weak.upgrade() {
                        Some(connector) if connector.connect.get() => {
                            let mut cb = connector.new_connection_cb.borrow_mut();
                            match cb.as_mut() {
                                Some(cb) => cb(fd),
                                None => sockets::close(fd),
                            }
                        }
                        _ => sockets::close(fd),
                    }
                });
            } else {
                sockets::close(fd);
            }
        }
    }

    fn handle_error(self: &Rc<Self>) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        let fd = self.take_channel();
        let err = sockets::socket_error(fd);
        kerror!(
            "connector {}: SO_ERROR = {} ({})",
            self.server_addr,
            err,
            Errno::from_raw(err)
        );
        self.retry(fd);
    }

    fn retry(self: &Rc<Self>, fd: RawFd) {
        sockets::close(fd);
        self.state.set(ConnectorState::Disconnected);
        if !self.connect.get() {
            kdebug!("connector {}: retry suppressed", self.server_addr);
            return;
        }
        let delay = self.retry_delay.get();
        kinfo!(
            "connector {}: retrying in {} ms",
            self.server_addr,
            delay.as_millis()
        );
        let weak = Rc::downgrade(self);
        self.event_loop.run_after(delay, move || {
            if let Some(connector) = weak.upgrade() {
                if connector.connect.get() {
                    connector.do_connect();
                }
            }
        });
        self.retry_delay.set(std::cmp::min(delay * 2, MAX_RETRY_DELAY));
    }
}

pub struct TcpClient {
    event_loop: Rc<EventLoop>,
    connector: Rc<Connector>,
    name: String,
    connection_cb: RefCell<ConnectionCallback>,
    message_cb: RefCell<MessageCallback>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    retry: Cell<bool>,
    connect: Cell<bool>,
    next_conn_id: Cell<u64>,
    connection: RefCell<Option<TcpConnectionPtr>>,
}

impl TcpClient {
    pub fn new(
        event_loop: &Rc<EventLoop>,
        server_addr: SocketAddrV4,
        name: &str,
    ) -> Rc<TcpClient> {
        crate::init();
        let client = Rc::new(TcpClient {
            event_loop: event_loop.clone(),
            connector: Connector::new(event_loop, server_addr),
            name: name.to_string(),
            connection_cb: RefCell::new(Arc::new(default_connection_callback)),
            message_cb: RefCell::new(Arc::new(default_message_callback)),
            write_complete_cb: RefCell::new(None),
            retry: Cell::new(false),
            connect: Cell::new(true),
            next_conn_id: Cell::new(1),
            connection: RefCell::new(None),
        });
        let weak = Rc::downgrade(&client);
        client
            .connector
            .set_new_connection_callback(Box::new(move |fd| {
                match weak.upgrade() {
                    Some(client) => client.new_connection(fd),
                    None => sockets::close(fd),
                }
            }));
        kdebug!("TcpClient[{}] -> {}", name, server_addr);
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> SocketAddrV4 {
        self.connector.server_addr()
    }

    /// Reconnect automatically when an established connection drops.
    pub fn enable_retry(&self) {
        self.retry.set(true);
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.get()
    }

    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.borrow().clone()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.borrow_mut() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.borrow_mut() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.borrow_mut() = Some(cb);
    }

    pub fn connect(self: &Rc<Self>) {
        self.connect.set(true);
        self.connector.start();
    }

    /// Graceful: shut down the write half and let the peer finish.
    pub fn disconnect(&self) {
        self.connect.set(false);
        if let Some(conn) = self.connection.borrow().clone() {
            conn.shutdown();
        }
    }

    /// Abandon an in-flight connect attempt.
    pub fn stop(&self) {
        self.connect.set(false);
        self.connector.stop();
    }

    fn new_connection(self: &Rc<Self>, fd: RawFd) {
        self.event_loop.assert_in_loop_thread();
        let peer_addr = sockets::peer_addr(fd);
        let local_addr = sockets::local_addr(fd);
        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, conn_id);

        let conn = TcpConnection::new(&self.event_loop, conn_name, fd, local_addr, peer_addr);
        conn.set_connection_callback(self.connection_cb.borrow().clone());
        conn.set_message_callback(self.message_cb.borrow().clone());
        if let Some(cb) = self.write_complete_cb.borrow().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Rc::downgrade(self);
        conn.set_close_callback(Box::new(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            } else {
                let queued = conn.clone();
                conn.owner_loop()
                    .queue_in_loop(move || TcpConnection::connect_destroyed(&queued));
            }
        }));
        *self.connection.borrow_mut() = Some(conn.clone());
        TcpConnection::connect_established(&conn);
    }

    fn remove_connection(self: &Rc<Self>, conn: &TcpConnectionPtr) {
        self.event_loop.assert_in_loop_thread();
        let taken = self.connection.borrow_mut().take();
        debug_assert!(taken.map_or(false, |held| Rc::ptr_eq(&held, conn)));
        let queued = conn.clone();
        self.event_loop
            .queue_in_loop(move || TcpConnection::connect_destroyed(&queued));
        if self.retry.get() && self.connect.get() {
            kinfo!(
                "TcpClient[{}] reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let conn = self.connection.borrow_mut().take();
        match conn {
            Some(conn) => {
                // Out-live the client: let the loop finish the teardown.
                conn.set_close_callback(Box::new(|conn| {
                    let queued = conn.clone();
                    conn.owner_loop()
                        .queue_in_loop(move || TcpConnection::connect_destroyed(&queued));
                }));
                conn.force_close();
            }
            None => self.connector.stop(),
        }
    }
}
