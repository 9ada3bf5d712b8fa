//! Reactor core: one `EventLoop` per thread, `Channel` for per-fd event
//! dispatch, pluggable `Poller` backends (epoll by default, poll(2) when
//! `MUXIO_USE_POLL` is set), and a timerfd-driven `TimerQueue`.
//!
//! Everything except `LoopHandle` is confined to the loop's owner thread.
//! Cross-thread callers clone a `LoopHandle` and go through `run_in_loop`
//! / `queue_in_loop` / the timer helpers; the loop drains queued work at
//! the tail of every iteration.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod channel;
        pub mod event_loop;
        pub mod event_loop_thread;
        pub mod poller;
        pub mod timer;

        pub use channel::Channel;
        pub use event_loop::{EventLoop, LoopHandle};
        pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
        pub use timer::TimerId;
    } else {
        compile_error!("muxio-reactor requires Linux (epoll, eventfd, timerfd)");
    }
}
