//! A thread that owns exactly one event loop, plus a round-robin pool of
//! them for multi-loop servers.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use muxio_core::{kerror, kfatal};

use crate::event_loop::{EventLoop, LoopHandle};

/// Runs on the new thread after its loop is constructed, before the loop
/// starts. Servers use this to prime per-loop state.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

pub struct EventLoopThread {
    handle: LoopHandle,
    join: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawn the thread, create its loop, and block until the loop is
    /// ready to accept work.
    pub fn start(name: &str, init: Option<ThreadInitCallback>) -> EventLoopThread {
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // A panic escaping an event loop leaves connections and
                // timers in an unknown state; treat it as fatal.
                let outcome = catch_unwind(AssertUnwindSafe(move || {
                    let event_loop = EventLoop::new();
                    if let Some(init) = init {
                        init(&event_loop);
                    }
                    if tx.send(event_loop.handle()).is_err() {
                        return;
                    }
                    event_loop.run();
                }));
                if outcome.is_err() {
                    kerror!(
                        "event loop thread '{}' panicked, aborting",
                        thread::current().name().unwrap_or("?")
                    );
                    std::process::abort();
                }
            });
        let join = match spawned {
            Ok(join) => join,
            Err(err) => kfatal!("spawning event loop thread: {}", err),
        };
        let handle = match rx.recv() {
            Ok(handle) => handle,
            Err(_) => kfatal!("event loop thread died during startup"),
        };
        EventLoopThread {
            handle,
            join: Some(join),
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        // Quit via the task queue: a bare quit() could race ahead of
        // run() and be wiped by its flag reset. A queued quit only runs
        // once the loop is actually looping.
        let handle = self.handle.clone();
        self.handle.queue_in_loop(move || handle.quit());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Fixed-size pool of event loop threads. With zero threads every
/// `next_loop` call hands back the base loop, so single-loop and
/// multi-loop callers share one code path.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    threads: Vec<EventLoopThread>,
    handles: Vec<LoopHandle>,
    num_threads: usize,
    next: Cell<usize>,
    started: bool,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_string(),
            threads: Vec::new(),
            handles: Vec::new(),
            num_threads: 0,
            next: Cell::new(0),
            started: false,
        }
    }

    pub fn set_num_threads(&mut self, num_threads: usize) {
        assert!(!self.started);
        self.num_threads = num_threads;
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started);
        assert!(self.base.is_in_loop_thread());
        self.started = true;
        for i in 0..self.num_threads {
            let thread_name = format!("{}-io-{}", self.name, i);
            let thread = EventLoopThread::start(&thread_name, init.clone());
            self.handles.push(thread.handle().clone());
            self.threads.push(thread);
        }
        if self.num_threads == 0 {
            if let Some(init) = init {
                match EventLoop::current() {
                    Some(event_loop) => init(&event_loop),
                    None => kfatal!("pool started outside an event loop"),
                }
            }
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Round-robin pick. Falls back to the base loop when the pool has no
    /// threads of its own.
    pub fn next_loop(&self) -> LoopHandle {
        assert!(self.started);
        if self.handles.is_empty() {
            return self.base.clone();
        }
        let i = self.next.get();
        self.next.set((i + 1) % self.handles.len());
        self.handles[i].clone()
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.handles.is_empty() {
            vec![self.base.clone()]
        } else {
            self.handles.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_thread_loop_runs_posted_work() {
        let thread = EventLoopThread::start("test-loop", None);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let c = counter.clone();
        thread.handle().run_in_loop(move || {
            c.fetch_add(1, Ordering::Relaxed);
            tx.send(()).ok();
        });
        rx.recv().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_init_callback_runs_before_loop() {
        let flag = Arc::new(AtomicUsize::new(0));
        let f = flag.clone();
        let init: ThreadInitCallback = Arc::new(move |_| {
            f.fetch_add(1, Ordering::Relaxed);
        });
        let thread = EventLoopThread::start("test-init", Some(init));
        // start() waits for the loop, so init has already run.
        assert_eq!(flag.load(Ordering::Relaxed), 1);
        drop(thread);
    }

    #[test]
    fn test_pool_round_robin() {
        let base = EventLoopThread::start("pool-base", None);
        let base_handle = base.handle().clone();
        let (tx, rx) = mpsc::channel();
        base_handle.run_in_loop(move || {
            let base = match EventLoop::current() {
                Some(event_loop) => event_loop.handle(),
                None => unreachable!(),
            };
            let mut pool = EventLoopThreadPool::new(base, "pool");
            pool.set_num_threads(2);
            pool.start(None);
            let a = pool.next_loop();
            let b = pool.next_loop();
            let c = pool.next_loop();
            // Two distinct loops, then wrap-around.
            assert!(!a.same_loop(&b));
            assert!(a.same_loop(&c));
            tx.send(()).ok();
        });
        rx.recv().unwrap();
    }
}
