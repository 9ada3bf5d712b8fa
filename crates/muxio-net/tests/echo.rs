//! Full-stack test: TcpServer and TcpClient over loopback.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use muxio_net::{TcpClient, TcpServer};
use muxio_reactor::EventLoop;

fn loopback() -> SocketAddrV4 {
    // Port 0: the kernel picks a free port, read back after bind.
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
}

/// Server thread: echo everything, report the bound address, quit when
/// asked.
fn spawn_echo_server(
    num_threads: usize,
) -> (SocketAddrV4, muxio_reactor::LoopHandle, thread::JoinHandle<()>) {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let server = TcpServer::new(&event_loop, loopback(), "echo-test", false);
        server.set_num_threads(num_threads);
        server.set_message_callback(Arc::new(|conn, buf, _when| {
            let data = buf.retrieve_all_as_bytes();
            conn.send(&data);
        }));
        server.start();
        addr_tx.send(server.listen_addr()).ok();
        handle_tx.send(event_loop.handle()).ok();
        event_loop.run();
    });
    let addr = addr_rx.recv().unwrap();
    let handle = handle_rx.recv().unwrap();
    (addr, handle, join)
}

#[test]
fn echo_round_trip_single_loop() {
    muxio_net::init();
    let (addr, server_handle, server_join) = spawn_echo_server(0);

    let received = Arc::new(Mutex::new(Vec::new()));
    let client_join = {
        let received = received.clone();
        thread::spawn(move || {
            let event_loop = EventLoop::new();
            let client = TcpClient::new(&event_loop, addr, "echo-client");
            client.set_connection_callback(Arc::new(|conn| {
                if conn.connected() {
                    conn.send(b"hello muxio");
                }
            }));
            let handle = event_loop.handle();
            client.set_message_callback(Arc::new(move |conn, buf, _when| {
                if buf.readable_bytes() >= 11 {
                    received.lock().unwrap().extend(buf.retrieve_all_as_bytes());
                    conn.shutdown();
                    handle.quit();
                }
            }));
            client.connect();
            event_loop.run();
        })
    };

    client_join.join().unwrap();
    assert_eq!(received.lock().unwrap().as_slice(), b"hello muxio");

    server_handle.quit();
    server_join.join().unwrap();
}

#[test]
fn echo_round_trip_thread_pool() {
    muxio_net::init();
    let (addr, server_handle, server_join) = spawn_echo_server(2);
    let completed = Arc::new(AtomicUsize::new(0));

    // Several clients so both io loops get traffic.
    let clients: Vec<_> = (0..4)
        .map(|i| {
            let completed = completed.clone();
            thread::spawn(move || {
                let payload: Vec<u8> = format!("client-{i}-payload").into_bytes();
                let expect_len = payload.len();
                let event_loop = EventLoop::new();
                let client =
                    TcpClient::new(&event_loop, addr, &format!("pool-client-{i}"));
                {
                    let payload = payload.clone();
                    client.set_connection_callback(Arc::new(move |conn| {
                        if conn.connected() {
                            conn.send(&payload);
                        }
                    }));
                }
                let handle = event_loop.handle();
                client.set_message_callback(Arc::new(move |conn, buf, _when| {
                    if buf.readable_bytes() >= expect_len {
                        assert_eq!(buf.retrieve_all_as_bytes(), payload);
                        completed.fetch_add(1, Ordering::Relaxed);
                        conn.shutdown();
                        handle.quit();
                    }
                }));
                client.connect();
                event_loop.run();
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
    assert_eq!(completed.load(Ordering::Relaxed), 4);

    server_handle.quit();
    server_join.join().unwrap();
}

#[test]
fn client_retries_until_server_appears() {
    muxio_net::init();
    // Nothing listens yet; grab a port by binding and dropping.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = match probe.local_addr().unwrap() {
        std::net::SocketAddr::V4(v4) => v4,
        _ => unreachable!(),
    };
    drop(probe);

    let connected = Arc::new(AtomicUsize::new(0));
    let client_join = {
        let connected = connected.clone();
        thread::spawn(move || {
            let event_loop = EventLoop::new();
            let client = TcpClient::new(&event_loop, addr, "retry-client");
            let handle = event_loop.handle();
            client.set_connection_callback(Arc::new(move |conn| {
                if conn.connected() {
                    connected.fetch_add(1, Ordering::Relaxed);
                    conn.shutdown();
                    handle.quit();
                }
            }));
            client.connect();
            event_loop.run();
        })
    };

    // Let at least one attempt fail, then bring the server up.
    thread::sleep(Duration::from_millis(200));
    let (server_tx, server_rx) = mpsc::channel();
    let server_join = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let server = TcpServer::new(&event_loop, addr, "late-server", false);
        server.start();
        server_tx.send(event_loop.handle()).ok();
        event_loop.run();
    });
    let server_handle = server_rx.recv().unwrap();

    client_join.join().unwrap();
    assert_eq!(connected.load(Ordering::Relaxed), 1);
    server_handle.quit();
    server_join.join().unwrap();
}
