//! One `EventLoop` per thread. The loop alternates between waiting on its
//! poller, dispatching active channels, and draining the pending-task
//! queue. An eventfd wired into the poller lets other threads interrupt
//! the wait.
//!
//! Thread model: the `EventLoop` itself (and everything reachable through
//! `Rc`) is confined to the thread that created it. `LoopHandle` is the
//! `Send + Sync` face; it carries only atomics and the locked task queue.

use std::cell::{Cell, OnceCell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use muxio_core::{kdebug, kerror, kfatal, ktrace, kwarn, Timestamp};

use crate::channel::Channel;
use crate::poller::{self, Poller};
use crate::timer::{self, TimerId, TimerQueue};

const POLL_TIME_MS: i32 = 1;

// ── task queue ──────────────────────────────────────────────────────────

/// A queued unit of work. Tasks built from `Send` closures may be queued
/// from any thread; tasks built from non-`Send` closures may only be
/// queued by the loop's own thread. Either way a task only ever *runs* on
/// the loop thread, which is what makes the `Send` impl sound.
pub(crate) struct Task(Box<dyn FnOnce()>);

unsafe impl Send for Task {}

impl Task {
    fn from_send(f: impl FnOnce() + Send + 'static) -> Task {
        Task(Box::new(f))
    }

    /// Caller must be on the loop thread that will also run the task.
    fn from_local(f: impl FnOnce() + 'static) -> Task {
        Task(Box::new(f))
    }

    fn run(self) {
        (self.0)()
    }
}

// ── cross-thread state ──────────────────────────────────────────────────

pub(crate) struct LoopShared {
    tid: ThreadId,
    tid_num: libc::pid_t,
    /// eventfd for waking the poller, -1 once the loop is destroyed.
    wakeup_fd: AtomicI32,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    quit: AtomicBool,
}

impl LoopShared {
    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.tid
    }

    fn queue(&self, task: Task) {
        {
            let mut pending = match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            pending.push(task);
        }
        // The loop only re-checks the queue after its next poll returns;
        // wake it unless it is about to drain the queue anyway.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        let fd = self.wakeup_fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        let one: u64 = 1;
        let n = unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8)
        };
        if n != 8 {
            kerror!("LoopShared::wakeup writes {} bytes instead of 8", n);
        }
    }
}

/// Cloneable, `Send + Sync` handle to an event loop. This is the only way
/// other threads talk to a loop: post work, schedule or cancel timers,
/// ask it to quit.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// True when both handles point at the same loop.
    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `f` immediately when called on the loop thread, otherwise
    /// queue it for that thread.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Always queue, even from the loop thread. Queued work runs after
    /// the current loop iteration's event dispatch.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.queue(Task::from_send(f));
    }

    pub fn run_at(&self, when: Timestamp, cb: impl FnMut() + Send + 'static) -> TimerId {
        let sequence = timer::next_sequence();
        self.run_in_loop(move || {
            let added = EventLoop::with_current(|event_loop| {
                event_loop
                    .timer_queue()
                    .add_timer_with_sequence(Box::new(cb), when, None, sequence);
            });
            if added.is_none() {
                kwarn!("run_at: event loop already destroyed");
            }
        });
        TimerId::new(sequence)
    }

    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Timestamp::now().add(delay), cb)
    }

    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        let sequence = timer::next_sequence();
        self.run_in_loop(move || {
            let when = Timestamp::now().add(interval);
            let added = EventLoop::with_current(|event_loop| {
                event_loop.timer_queue().add_timer_with_sequence(
                    Box::new(cb),
                    when,
                    Some(interval),
                    sequence,
                );
            });
            if added.is_none() {
                kwarn!("run_every: event loop already destroyed");
            }
        });
        TimerId::new(sequence)
    }

    pub fn cancel(&self, timer_id: TimerId) {
        self.run_in_loop(move || {
            EventLoop::with_current(|event_loop| {
                event_loop.timer_queue().cancel_in_loop(timer_id);
            });
        });
    }

    /// Ask the loop to exit after its current iteration. Work already
    /// queued for that iteration still runs.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.shared.wakeup();
        }
    }
}

// ── loop-thread state ───────────────────────────────────────────────────

/// The slice of loop state that channels need: thread identity and the
/// poller. Channels keep an `Rc<LoopCore>`, so poller unregistration
/// stays valid even while the owning `EventLoop` is being torn down.
pub struct LoopCore {
    shared: Arc<LoopShared>,
    poller: RefCell<Box<dyn Poller>>,
}

impl LoopCore {
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            kfatal!(
                "loop owned by thread {} used from thread {:?}",
                self.shared.tid_num,
                thread::current().id()
            );
        }
    }

    pub(crate) fn update_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Weak<EventLoop>>> = const { RefCell::new(None) };
}

pub struct EventLoop {
    core: Rc<LoopCore>,
    shared: Arc<LoopShared>,
    wakeup_channel: OnceCell<Channel>,
    timer_queue: OnceCell<Rc<TimerQueue>>,
    looping: Cell<bool>,
    poll_return_time: Cell<Timestamp>,
    active: RefCell<Vec<Channel>>,
    iteration: Cell<u64>,
}

impl EventLoop {
    /// Create the loop for the current thread. At most one loop may exist
    /// per thread; a second call before the first loop is dropped aborts.
    pub fn new() -> Rc<EventLoop> {
        muxio_core::klog::init();
        let existing = CURRENT_LOOP
            .with(|cur| cur.borrow().as_ref().and_then(Weak::upgrade));
        if existing.is_some() {
            kfatal!("another EventLoop already exists in this thread");
        }

        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            kfatal!("eventfd: {}", muxio_core::error::last_errno());
        }

        let shared = Arc::new(LoopShared {
            tid: thread::current().id(),
            tid_num: unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t },
            wakeup_fd: AtomicI32::new(wakeup_fd),
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            quit: AtomicBool::new(false),
        });
        let core = Rc::new(LoopCore {
            shared: shared.clone(),
            poller: RefCell::new(poller::new_default_poller()),
        });
        let event_loop = Rc::new(EventLoop {
            core,
            shared,
            wakeup_channel: OnceCell::new(),
            timer_queue: OnceCell::new(),
            looping: Cell::new(false),
            poll_return_time: Cell::new(Timestamp::invalid()),
            active: RefCell::new(Vec::new()),
            iteration: Cell::new(0),
        });
        CURRENT_LOOP.with(|cur| *cur.borrow_mut() = Some(Rc::downgrade(&event_loop)));

        let wakeup_channel = Channel::new(&event_loop, wakeup_fd);
        wakeup_channel.set_read_callback(move |_| {
            let mut buf: u64 = 0;
            let n = unsafe {
                libc::read(wakeup_fd, &mut buf as *mut u64 as *mut libc::c_void, 8)
            };
            if n != 8 {
                kerror!("wakeup read returns {} bytes instead of 8", n);
            }
        });
        wakeup_channel.enable_reading();
        let _ = event_loop.wakeup_channel.set(wakeup_channel);
        let _ = event_loop.timer_queue.set(TimerQueue::new(&event_loop));

        kdebug!(
            "EventLoop created in thread {}",
            event_loop.shared.tid_num
        );
        event_loop
    }

    /// The loop registered for the current thread, if any.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|cur| cur.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub(crate) fn with_current<R>(f: impl FnOnce(&EventLoop) -> R) -> Option<R> {
        Self::current().map(|event_loop| f(&event_loop))
    }

    pub fn core(&self) -> &Rc<LoopCore> {
        &self.core
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.core.assert_in_loop_thread();
    }

    /// Timestamp taken right after the most recent poll returned; this is
    /// the receive time handed to read callbacks.
    pub fn poll_return_time(&self) -> Timestamp {
        self.poll_return_time.get()
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.get()
    }

    /// Run until `quit()`. Must be called on the owner thread.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.looping.get());
        self.looping.set(true);
        self.shared.quit.store(false, Ordering::Release);
        kdebug!("EventLoop in thread {} starts looping", self.shared.tid_num);

        while !self.shared.quit.load(Ordering::Acquire) {
            let mut active = std::mem::take(&mut *self.active.borrow_mut());
            active.clear();
            let poll_time = self
                .core
                .poller
                .borrow_mut()
                .poll(POLL_TIME_MS, &mut active);
            self.poll_return_time.set(poll_time);
            self.iteration.set(self.iteration.get() + 1);

            for channel in &active {
                channel.handle_event(poll_time);
            }
            *self.active.borrow_mut() = active;

            self.do_pending_tasks();
        }

        kdebug!("EventLoop in thread {} stops looping", self.shared.tid_num);
        self.looping.set(false);
    }

    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Same-thread counterpart of `LoopHandle::run_in_loop`; accepts
    /// non-`Send` closures and therefore asserts the caller is already on
    /// the loop thread.
    pub fn run_in_loop(&self, f: impl FnOnce() + 'static) {
        self.assert_in_loop_thread();
        f();
    }

    /// Defer `f` to the tail of the current (or next) loop iteration.
    /// Loop-thread only; this is how callbacks schedule work that must
    /// not run re-entrantly.
    pub fn queue_in_loop(&self, f: impl FnOnce() + 'static) {
        self.assert_in_loop_thread();
        self.shared.queue(Task::from_local(f));
    }

    pub fn run_at(&self, when: Timestamp, cb: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.timer_queue().add_timer(Box::new(cb), when, None)
    }

    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + 'static) -> TimerId {
        self.run_at(Timestamp::now().add(delay), cb)
    }

    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.timer_queue()
            .add_timer(Box::new(cb), Timestamp::now().add(interval), Some(interval))
    }

    pub fn cancel(&self, timer_id: TimerId) {
        self.assert_in_loop_thread();
        self.timer_queue().cancel_in_loop(timer_id);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.core.has_channel(channel)
    }

    pub(crate) fn timer_queue(&self) -> &Rc<TimerQueue> {
        // Set unconditionally in new().
        match self.timer_queue.get() {
            Some(queue) => queue,
            None => kfatal!("timer queue missing"),
        }
    }

    fn do_pending_tasks(&self) {
        let mut tasks = Vec::new();
        self.shared.calling_pending.store(true, Ordering::Release);
        {
            let mut pending = match self.shared.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::swap(&mut *pending, &mut tasks);
        }
        if !tasks.is_empty() {
            ktrace!("running {} pending task(s)", tasks.len());
        }
        for task in tasks {
            task.run();
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        kdebug!("EventLoop in thread {} destructs", self.shared.tid_num);
        if let Some(timer_queue) = self.timer_queue.take() {
            drop(timer_queue);
        }
        if let Some(wakeup_channel) = self.wakeup_channel.take() {
            wakeup_channel.disable_all();
            wakeup_channel.remove();
        }
        let fd = self.shared.wakeup_fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        CURRENT_LOOP.with(|cur| cur.borrow_mut().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_one_loop_per_thread_registry() {
        let event_loop = EventLoop::new();
        assert!(EventLoop::current().is_some());
        assert!(event_loop.is_in_loop_thread());
        drop(event_loop);
        assert!(EventLoop::current().is_none());
        // A fresh loop may be created once the old one is gone.
        let again = EventLoop::new();
        assert!(EventLoop::current().is_some());
        drop(again);
    }

    #[test]
    fn test_quit_before_run_still_drains_queue() {
        let event_loop = EventLoop::new();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        event_loop.queue_in_loop(move || h.set(h.get() + 1));
        let handle = event_loop.handle();
        event_loop.queue_in_loop(move || handle.quit());
        event_loop.run();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_run_in_loop_from_other_thread() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let counter = Arc::new(AtomicUsize::new(0));

        let worker = {
            let handle = handle.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                assert!(!handle.is_in_loop_thread());
                for _ in 0..100 {
                    let counter = counter.clone();
                    handle.run_in_loop(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                // Queue the quit so it runs after the 100 tasks above.
                let quitter = handle.clone();
                handle.run_in_loop(move || quitter.quit());
            })
        };

        event_loop.run();
        worker.join().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_queue_in_loop_runs_after_dispatch() {
        // A task queued by another task runs in a later drain of the same
        // run, not recursively.
        let event_loop = EventLoop::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let handle = event_loop.handle();
        event_loop.queue_in_loop(move || {
            o1.borrow_mut().push("outer");
            EventLoop::with_current(|event_loop| {
                let o2 = o2.clone();
                let handle = handle.clone();
                event_loop.queue_in_loop(move || {
                    o2.borrow_mut().push("inner");
                    handle.quit();
                });
            });
        });
        event_loop.run();
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }
}
