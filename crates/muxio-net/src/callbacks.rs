//! Application callback signatures shared by server and client.
//!
//! Callbacks are `Arc<dyn Fn .. + Send + Sync>` because a server clones
//! them once per connection into whichever io loop the connection lands
//! on; each individual invocation still happens on that connection's own
//! loop thread.

use std::rc::Rc;
use std::sync::Arc;

use muxio_core::{kinfo, Buffer, Timestamp};

use crate::connection::TcpConnection;

pub type TcpConnectionPtr = Rc<TcpConnection>;

/// Invoked on establishment and on teardown; check `connected()` to tell
/// which.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked with the input buffer whenever bytes arrive. The callback
/// decides how much to retrieve; leftover bytes stay for the next call.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;

/// Invoked once the output buffer fully drains to the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

/// Invoked when the output buffer crosses the high-water mark, with the
/// current backlog size.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;

/// Internal: wired by `TcpServer`/`TcpClient` to unregister a connection.
pub(crate) type CloseCallback = Box<dyn Fn(&TcpConnectionPtr)>;

pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    kinfo!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _when: Timestamp) {
    buf.retrieve_all();
}
