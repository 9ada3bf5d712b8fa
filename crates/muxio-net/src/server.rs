//! TCP server: acceptor on the base loop, connections sharded round-
//! robin over an event loop pool.
//!
//! A connection's strong `Rc` lives in a thread-local registry on its
//! own io loop; the base loop keeps only name -> loop-handle bookkeeping
//! so teardown can reach every connection without touching `Rc`s across
//! threads.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use muxio_core::{kfatal, kinfo};
use muxio_reactor::{EventLoop, EventLoopThreadPool, LoopHandle, ThreadInitCallback};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    MessageCallback, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::sockets;

thread_local! {
    // Strong refs to the connections owned by this thread's loop.
    static LOOP_CONNECTIONS: RefCell<HashMap<String, TcpConnectionPtr>> =
        RefCell::new(HashMap::new());
}

type ConnectionDirectory = Arc<Mutex<HashMap<String, LoopHandle>>>;

pub struct TcpServer {
    event_loop: Rc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Rc<Acceptor>,
    pool: RefCell<EventLoopThreadPool>,
    connection_cb: RefCell<ConnectionCallback>,
    message_cb: RefCell<MessageCallback>,
    write_complete_cb: RefCell<Option<WriteCompleteCallback>>,
    thread_init_cb: RefCell<Option<ThreadInitCallback>>,
    started: Cell<bool>,
    next_conn_id: Cell<u64>,
    directory: ConnectionDirectory,
}

impl TcpServer {
    pub fn new(
        event_loop: &Rc<EventLoop>,
        listen_addr: SocketAddrV4,
        name: &str,
        reuse_port: bool,
    ) -> Rc<TcpServer> {
        crate::init();
        let acceptor = Acceptor::new(event_loop, listen_addr, reuse_port);
        let server = Rc::new(TcpServer {
            event_loop: event_loop.clone(),
            name: name.to_string(),
            ip_port: listen_addr.to_string(),
            acceptor,
            pool: RefCell::new(EventLoopThreadPool::new(event_loop.handle(), name)),
            connection_cb: RefCell::new(Arc::new(default_connection_callback)),
            message_cb: RefCell::new(Arc::new(default_message_callback)),
            write_complete_cb: RefCell::new(None),
            thread_init_cb: RefCell::new(None),
            started: Cell::new(false),
            next_conn_id: Cell::new(1),
            directory: Arc::new(Mutex::new(HashMap::new())),
        });
        let weak = Rc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |fd, peer_addr| {
                match weak.upgrade() {
                    Some(server) => server.new_connection(fd, peer_addr),
                    None => sockets::close(fd),
                }
            }));
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn listen_addr(&self) -> SocketAddrV4 {
        self.acceptor.local_addr()
    }

    /// Number of io loops. Zero (the default) keeps everything on the
    /// base loop.
    pub fn set_num_threads(&self, num_threads: usize) {
        self.pool.borrow_mut().set_num_threads(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init_cb.borrow_mut() = Some(cb);
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

    /// Start the pool and begin listening. Idempotent.
    pub fn start(&self) {
        if self.started.replace(true) {
            return;
        }
        self.event_loop.assert_in_loop_thread();
        self.pool.borrow_mut().start(self.thread_init_cb.borrow().clone());
        assert!(!self.acceptor.listening());
        kinfo!("TcpServer[{}] listening on {}", self.name, self.ip_port);
        self.acceptor.listen();
    }

    pub fn connection_count(&self) -> usize {
        match self.directory.lock() {
            Ok(directory) => directory.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn new_connection(&self, fd: RawFd, peer_addr: SocketAddrV4) {
        self.event_loop.assert_in_loop_thread();
        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        kinfo!(
            "TcpServer[{}] new connection [{}] from {}",
            self.name,
            conn_name,
            peer_addr
        );
        let local_addr = sockets::local_addr(fd);
        let io_loop = self.pool.borrow().next_loop();

        let connection_cb = self.connection_cb.borrow().clone();
        let message_cb = self.message_cb.borrow().clone();
        let write_complete_cb = self.write_complete_cb.borrow().clone();
        let directory = self.directory.clone();
        match directory.lock() {
            Ok(mut map) => {
                map.insert(conn_name.clone(), io_loop.clone());
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(conn_name.clone(), io_loop.clone());
            }
        }

        io_loop.run_in_loop(move || {
            let event_loop = match EventLoop::current() {
                Some(event_loop) => event_loop,
                None => kfatal!("io loop thread has no event loop"),
            };
            let conn =
                TcpConnection::new(&event_loop, conn_name.clone(), fd, local_addr, peer_addr);
            conn.set_connection_callback(connection_cb);
            conn.set_message_callback(message_cb);
            if let Some(cb) = write_complete_cb {
                conn.set_write_complete_callback(cb);
            }
            wire_close_callback(&conn, directory);
            LOOP_CONNECTIONS.with(|map| {
                map.borrow_mut().insert(conn_name, conn.clone());
            });
            TcpConnection::connect_established(&conn);
        });
    }
}

/// On close: drop the directory entry, drop this loop's strong ref, and
/// queue the final destroy so the channel finishes its dispatch first.
fn wire_close_callback(conn: &TcpConnectionPtr, directory: ConnectionDirectory) {
    conn.set_close_callback(Box::new(move |conn| {
        let name = conn.name().to_string();
        match directory.lock() {
            Ok(mut map) => {
                map.remove(&name);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&name);
            }
        }
        LOOP_CONNECTIONS.with(|map| {
            map.borrow_mut().remove(&name);
        });
        let queued = conn.clone();
        conn.owner_loop()
            .queue_in_loop(move || TcpConnection::connect_destroyed(&queued));
    }));
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.event_loop.assert_in_loop_thread();
        kinfo!("TcpServer[{}] destructing", self.name);
        let entries: Vec<(String, LoopHandle)> = {
            let mut directory = match self.directory.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            directory.drain().collect()
        };
        for (name, io_loop) in entries {
            io_loop.run_in_loop(move || {
                let conn = LOOP_CONNECTIONS.with(|map| map.borrow_mut().remove(&name));
                if let Some(conn) = conn {
                    // The directory entry is already gone; drop the close
                    // callback so it cannot double-bookkeep.
                    conn.set_close_callback(Box::new(|_| {}));
                    TcpConnection::connect_destroyed(&conn);
                }
            });
        }
    }
}
