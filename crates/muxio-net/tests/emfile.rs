//! Acceptor behavior at descriptor-table exhaustion. Lives in its own
//! test binary because it deliberately fills this process's fd table.

use std::cell::Cell;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use muxio_net::acceptor::Acceptor;
use muxio_reactor::EventLoop;

/// dup(0) until EMFILE; returns the hoarded fds.
fn exhaust_fd_table() -> Vec<RawFd> {
    let mut hoard = Vec::new();
    loop {
        let fd = unsafe { libc::dup(0) };
        if fd < 0 {
            break;
        }
        hoard.push(fd);
    }
    hoard
}

fn release(hoard: Vec<RawFd>) {
    for fd in hoard {
        unsafe { libc::close(fd) };
    }
}

#[test]
fn accept_survives_fd_exhaustion() {
    muxio_net::init();
    let event_loop = EventLoop::new();
    let acceptor = Acceptor::new(
        &event_loop,
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        false,
    );
    let accepted = Rc::new(Cell::new(0u32));
    {
        let accepted = accepted.clone();
        acceptor.set_new_connection_callback(Box::new(move |fd, _peer| {
            accepted.set(accepted.get() + 1);
            unsafe { libc::close(fd) };
        }));
    }
    acceptor.listen();
    let addr = acceptor.local_addr();

    // Phase 1: connect while the table is full. The kernel completes the
    // handshake via the backlog; the acceptor must shed the connection
    // with a clean close instead of spinning on a readable listen fd.
    let mut starved = TcpStream::connect(addr).unwrap();
    starved
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let hoard = exhaust_fd_table();

    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(200), move || handle.quit());
    event_loop.run();

    release(hoard);
    assert_eq!(accepted.get(), 0);
    let mut byte = [0u8; 1];
    // Clean close: EOF, not a timeout or reset.
    assert_eq!(starved.read(&mut byte).unwrap(), 0);

    // Phase 2: with the table back to normal the next connection must
    // be accepted, proving the reserve fd was re-established.
    let _healthy = TcpStream::connect(addr).unwrap();
    let handle = event_loop.handle();
    event_loop.run_after(Duration::from_millis(200), move || handle.quit());
    event_loop.run();
    assert_eq!(accepted.get(), 1);
}
