//! timerfd-backed timer queue. All timers of a loop share one timerfd,
//! programmed to the earliest deadline; a dispatch pops every timer whose
//! deadline has passed, runs the callbacks, then re-arms.
//!
//! Two indices are kept in lockstep: `timers` ordered by (deadline,
//! sequence) for expiry, and `active` keyed by sequence for O(log n)
//! cancel. A repeating timer canceled from inside its own callback lands
//! in `canceling` so the re-arm pass knows not to resurrect it.

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use muxio_core::timestamp::MICROS_PER_SEC;
use muxio_core::{kerror, kfatal, ktrace, Timestamp};

use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopCore};

pub type TimerCallback = Box<dyn FnMut()>;

static NEXT_SEQUENCE: AtomicI64 = AtomicI64::new(1);

pub(crate) fn next_sequence() -> i64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Opaque handle for cancellation. Sequence numbers are process-global
/// and never reused, so a stale id can never cancel someone else's timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerId {
    sequence: i64,
}

impl TimerId {
    pub(crate) fn new(sequence: i64) -> TimerId {
        TimerId { sequence }
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }
}

struct Timer {
    callback: TimerCallback,
    expiration: Timestamp,
    interval: Option<Duration>,
    sequence: i64,
}

impl Timer {
    fn run(&mut self) {
        (self.callback)();
    }

    fn restart(&mut self, now: Timestamp) {
        // Repeating timers re-arm relative to the dispatch time, not the
        // missed deadline, so a stalled loop does not burst-fire.
        match self.interval {
            Some(interval) => self.expiration = now.add(interval),
            None => self.expiration = Timestamp::invalid(),
        }
    }
}

pub(crate) struct TimerQueue {
    core: Rc<LoopCore>,
    timer_fd: RawFd,
    channel: OnceCell<Channel>,
    timers: RefCell<BTreeMap<(Timestamp, i64), Timer>>,
    active: RefCell<BTreeMap<i64, Timestamp>>,
    calling_expired: Cell<bool>,
    canceling: RefCell<HashSet<i64>>,
}

impl TimerQueue {
    pub(crate) fn new(event_loop: &Rc<EventLoop>) -> Rc<TimerQueue> {
        let timer_fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if timer_fd < 0 {
            kfatal!("timerfd_create: {}", muxio_core::error::last_errno());
        }

        let queue = Rc::new(TimerQueue {
            core: event_loop.core().clone(),
            timer_fd,
            channel: OnceCell::new(),
            timers: RefCell::new(BTreeMap::new()),
            active: RefCell::new(BTreeMap::new()),
            calling_expired: Cell::new(false),
            canceling: RefCell::new(HashSet::new()),
        });
        let channel = Channel::new(event_loop, timer_fd);
        let weak = Rc::downgrade(&queue);
        channel.set_read_callback(move |_| {
            if let Some(queue) = Weak::upgrade(&weak) {
                queue.handle_read();
            }
        });
        channel.enable_reading();
        let _ = queue.channel.set(channel);
        queue
    }

    pub(crate) fn add_timer(
        &self,
        callback: TimerCallback,
        when: Timestamp,
        interval: Option<Duration>,
    ) -> TimerId {
        let sequence = next_sequence();
        self.add_timer_with_sequence(callback, when, interval, sequence);
        TimerId::new(sequence)
    }

    /// Insert with a pre-allocated sequence number; cross-thread callers
    /// hand out the `TimerId` before the insert reaches the loop thread.
    pub(crate) fn add_timer_with_sequence(
        &self,
        callback: TimerCallback,
        when: Timestamp,
        interval: Option<Duration>,
        sequence: i64,
    ) {
        self.core.assert_in_loop_thread();
        let timer = Timer {
            callback,
            expiration: when,
            interval,
            sequence,
        };
        if self.insert(timer) {
            reset_timer_fd(self.timer_fd, when);
        }
    }

    pub(crate) fn cancel_in_loop(&self, timer_id: TimerId) {
        self.core.assert_in_loop_thread();
        let sequence = timer_id.sequence;
        let removed = self.active.borrow_mut().remove(&sequence);
        match removed {
            Some(expiration) => {
                let timer = self
                    .timers
                    .borrow_mut()
                    .remove(&(expiration, sequence));
                assert!(timer.is_some());
            }
            None => {
                // Not pending: either already fired and gone, or firing
                // right now. Only the second case needs the marker.
                if self.calling_expired.get() {
                    self.canceling.borrow_mut().insert(sequence);
                }
            }
        }
        debug_assert_eq!(self.timers.borrow().len(), self.active.borrow().len());
    }

    fn handle_read(&self) {
        self.core.assert_in_loop_thread();
        let now = Timestamp::now();
        read_timer_fd(self.timer_fd);

        let expired = self.pop_expired(now);
        ktrace!("{} timer(s) expired", expired.len());

        self.calling_expired.set(true);
        self.canceling.borrow_mut().clear();
        let mut expired = expired;
        for timer in &mut expired {
            timer.run();
        }
        self.calling_expired.set(false);

        self.rearm(expired, now);
    }

    /// Remove and return every timer with deadline <= now, in deadline
    /// order.
    fn pop_expired(&self, now: Timestamp) -> Vec<Timer> {
        let expired_map = {
            let mut timers = self.timers.borrow_mut();
            let rest = timers.split_off(&(now, i64::MAX));
            std::mem::replace(&mut *timers, rest)
        };
        {
            let mut active = self.active.borrow_mut();
            for (_, sequence) in expired_map.keys() {
                let removed = active.remove(sequence);
                assert!(removed.is_some());
            }
        }
        debug_assert_eq!(self.timers.borrow().len(), self.active.borrow().len());
        expired_map.into_values().collect()
    }

    fn rearm(&self, expired: Vec<Timer>, now: Timestamp) {
        for mut timer in expired {
            let canceled = self.canceling.borrow().contains(&timer.sequence);
            if timer.interval.is_some() && !canceled {
                timer.restart(now);
                self.insert(timer);
            }
            // One-shot or canceled: the timer drops here.
        }
        let next = self.timers.borrow().keys().next().map(|key| key.0);
        if let Some(when) = next {
            if when.valid() {
                reset_timer_fd(self.timer_fd, when);
            }
        }
    }

    fn insert(&self, timer: Timer) -> bool {
        let mut timers = self.timers.borrow_mut();
        let mut active = self.active.borrow_mut();
        let earliest_changed = match timers.keys().next() {
            None => true,
            Some((earliest, _)) => timer.expiration < *earliest,
        };
        let sequence = timer.sequence;
        let expiration = timer.expiration;
        let prev = timers.insert((expiration, sequence), timer);
        assert!(prev.is_none());
        let prev = active.insert(sequence, expiration);
        assert!(prev.is_none());
        debug_assert_eq!(timers.len(), active.len());
        earliest_changed
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.disable_all();
            channel.remove();
        }
        unsafe { libc::close(self.timer_fd) };
    }
}

fn read_timer_fd(timer_fd: RawFd) {
    let mut expirations: u64 = 0;
    let n = unsafe {
        libc::read(
            timer_fd,
            &mut expirations as *mut u64 as *mut libc::c_void,
            8,
        )
    };
    if n != 8 {
        kerror!("timerfd read returns {} bytes instead of 8", n);
    }
}

/// Program the timerfd for `when`. A deadline in the past is clamped to
/// 100us in the future; arming with zero would disarm the fd instead.
fn reset_timer_fd(timer_fd: RawFd, when: Timestamp) {
    let mut micros = when.micros_since(Timestamp::now());
    if micros < 100 {
        micros = 100;
    }
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: (micros / MICROS_PER_SEC) as libc::time_t,
            tv_nsec: ((micros % MICROS_PER_SEC) * 1000) as libc::c_long,
        },
    };
    if unsafe { libc::timerfd_settime(timer_fd, 0, &new_value, std::ptr::null_mut()) } < 0 {
        kerror!("timerfd_settime: {}", muxio_core::error::last_errno());
    }
}
