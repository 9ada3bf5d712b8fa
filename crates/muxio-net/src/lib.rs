//! Non-blocking TCP built on `muxio-reactor`: `TcpServer` accepts and
//! shards connections across an event loop pool, `TcpClient` connects
//! with exponential retry, and `TcpConnection` carries the buffered,
//! callback-driven data path shared by both.
//!
//! Call [`init`] once before creating servers or clients; it configures
//! logging and ignores `SIGPIPE` so writes to half-closed sockets report
//! `EPIPE` instead of killing the process.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod acceptor;
        pub mod callbacks;
        pub mod client;
        pub mod connection;
        pub mod server;
        pub mod socket;
        pub(crate) mod sockets;

        pub use callbacks::{
            ConnectionCallback, HighWaterMarkCallback, MessageCallback,
            TcpConnectionPtr, WriteCompleteCallback,
        };
        pub use client::TcpClient;
        pub use connection::TcpConnection;
        pub use server::TcpServer;

        use std::sync::Once;

        static INIT: Once = Once::new();

        pub fn init() {
            INIT.call_once(|| {
                muxio_core::klog::init();
                use nix::sys::signal::{signal, SigHandler, Signal};
                if let Err(err) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
                    muxio_core::kwarn!("ignoring SIGPIPE failed: {}", err);
                }
            });
        }
    } else {
        compile_error!("muxio-net requires Linux");
    }
}
