//! TCP echo server.
//!
//! Usage:
//!     muxio-echo [port] [io_threads]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::exit;
use std::sync::Arc;

use muxio_core::{kerror, kinfo};
use muxio_net::TcpServer;
use muxio_reactor::EventLoop;

fn main() {
    muxio_net::init();
    let mut args = std::env::args().skip(1);
    let port: u16 = match args.next().map(|a| a.parse()).unwrap_or(Ok(9999)) {
        Ok(port) => port,
        Err(_) => {
            kerror!("usage: muxio-echo [port] [io_threads]");
            exit(2);
        }
    };
    let io_threads: usize = match args.next().map(|a| a.parse()).unwrap_or(Ok(0)) {
        Ok(n) => n,
        Err(_) => {
            kerror!("usage: muxio-echo [port] [io_threads]");
            exit(2);
        }
    };

    let event_loop = EventLoop::new();
    let listen_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let server = TcpServer::new(&event_loop, listen_addr, "echo", false);
    server.set_num_threads(io_threads);
    server.set_connection_callback(Arc::new(|conn| {
        kinfo!(
            "echo: {} {}",
            conn.peer_addr(),
            if conn.connected() { "connected" } else { "gone" }
        );
    }));
    server.set_message_callback(Arc::new(|conn, buf, _when| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    }));
    server.start();
    kinfo!("echo listening on {} with {} io thread(s)", listen_addr, io_threads);
    event_loop.run();
}
