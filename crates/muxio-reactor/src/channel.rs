//! A `Channel` owns the event dispatch for one file descriptor: which
//! events we are interested in, which events the poller reported, and the
//! callbacks to run for each. It never owns the fd itself.
//!
//! `Channel` is a cheap-clone handle (`Rc<RefCell<..>>`) so the poller can
//! hold weak references while the fd's real owner (acceptor, connection,
//! timer queue) holds the strong one.

use std::any::Any;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use muxio_core::Timestamp;
use muxio_core::ktrace;

use crate::event_loop::{EventLoop, LoopCore};

pub const NONE_EVENT: u32 = 0;
pub const READ_EVENT: u32 = (libc::POLLIN | libc::POLLPRI) as u32;
pub const WRITE_EVENT: u32 = libc::POLLOUT as u32;

// Poller bookkeeping. For epoll this is the registry state machine
// (new/added/deleted); for poll(2) it is the index into the pollfd array.
pub(crate) const INDEX_NEW: i32 = -1;
pub(crate) const INDEX_ADDED: i32 = 1;
pub(crate) const INDEX_DELETED: i32 = 2;

pub type ReadEventCallback = Box<dyn FnMut(Timestamp)>;
pub type EventCallback = Box<dyn FnMut()>;

struct ChannelInner {
    core: Rc<LoopCore>,
    fd: RawFd,
    events: u32,
    revents: u32,
    index: i32,
    log_hup: bool,
    tied: bool,
    tie: Option<Weak<dyn Any>>,
    event_handling: bool,
    pending_remove: bool,
    added_to_loop: bool,
    read_cb: Option<ReadEventCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<ChannelInner>>,
}

#[derive(Clone)]
pub(crate) struct WeakChannel(Weak<RefCell<ChannelInner>>);

impl WeakChannel {
    pub(crate) fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|inner| Channel { inner })
    }
}

impl Channel {
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> Channel {
        Channel {
            inner: Rc::new(RefCell::new(ChannelInner {
                core: event_loop.core().clone(),
                fd,
                events: NONE_EVENT,
                revents: 0,
                index: INDEX_NEW,
                log_hup: true,
                tied: false,
                tie: None,
                event_handling: false,
                pending_remove: false,
                added_to_loop: false,
                read_cb: None,
                write_cb: None,
                close_cb: None,
                error_cb: None,
            })),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakChannel {
        WeakChannel(Rc::downgrade(&self.inner))
    }

    pub(crate) fn ptr_eq(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    pub fn events(&self) -> u32 {
        self.inner.borrow().events
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.inner.borrow_mut().revents = revents;
    }

    pub(crate) fn index(&self) -> i32 {
        self.inner.borrow().index
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.inner.borrow_mut().index = index;
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Timestamp) + 'static) {
        self.inner.borrow_mut().read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + 'static) {
        self.inner.borrow_mut().error_cb = Some(Box::new(cb));
    }

    /// Suppress the warning log for POLLHUP without POLLIN. Connection
    /// close is an expected event there, not an anomaly.
    pub fn dont_log_hup(&self) {
        self.inner.borrow_mut().log_hup = false;
    }

    /// Tie this channel to the object that owns it. Before dispatching
    /// events the weak reference is upgraded and held for the duration of
    /// the dispatch, so a close callback that drops the owner's last
    /// strong reference cannot free it mid-dispatch. If the owner is
    /// already gone, the whole dispatch is skipped.
    pub fn tie(&self, owner: &Rc<dyn Any>) {
        let mut inner = self.inner.borrow_mut();
        inner.tie = Some(Rc::downgrade(owner));
        inner.tied = true;
    }

    pub fn enable_reading(&self) {
        self.inner.borrow_mut().events |= READ_EVENT;
        self.update();
    }

    pub fn disable_reading(&self) {
        self.inner.borrow_mut().events &= !READ_EVENT;
        self.update();
    }

    pub fn enable_writing(&self) {
        self.inner.borrow_mut().events |= WRITE_EVENT;
        self.update();
    }

    pub fn disable_writing(&self) {
        self.inner.borrow_mut().events &= !WRITE_EVENT;
        self.update();
    }

    pub fn disable_all(&self) {
        self.inner.borrow_mut().events = NONE_EVENT;
        self.update();
    }

    pub fn is_reading(&self) -> bool {
        self.inner.borrow().events & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.inner.borrow().events & WRITE_EVENT != 0
    }

    pub fn is_none_event(&self) -> bool {
        self.inner.borrow().events == NONE_EVENT
    }

    /// Unregister from the poller. Interest must already be fully
    /// disabled. Safe to call from inside one of this channel's own
    /// callbacks: the actual unregistration is then deferred until the
    /// current dispatch finishes.
    pub fn remove(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.event_handling {
                inner.pending_remove = true;
                return;
            }
        }
        self.remove_now();
    }

    fn remove_now(&self) {
        assert!(self.is_none_event());
        let core = self.core();
        core.remove_channel(self);
        self.inner.borrow_mut().added_to_loop = false;
    }

    fn update(&self) {
        let core = self.core();
        self.inner.borrow_mut().added_to_loop = true;
        core.update_channel(self);
    }

    fn core(&self) -> Rc<LoopCore> {
        self.inner.borrow().core.clone()
    }

    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tie = {
            let inner = self.inner.borrow();
            if inner.tied { inner.tie.clone() } else { None }
        };
        match tie {
            Some(weak) => {
                // Owner already destroyed: drop the events on the floor.
                let Some(_guard) = weak.upgrade() else { return };
                self.handle_event_with_guard(receive_time);
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        let (fd, revents, log_hup) = {
            let mut inner = self.inner.borrow_mut();
            inner.event_handling = true;
            (inner.fd, inner.revents, inner.log_hup)
        };
        ktrace!("fd {} handling {}", fd, events_to_string(revents));

        let hup = libc::POLLHUP as u32;
        let nval = libc::POLLNVAL as u32;
        let err = libc::POLLERR as u32;
        let rd = (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) as u32;
        let wr = libc::POLLOUT as u32;

        if revents & hup != 0 && revents & libc::POLLIN as u32 == 0 {
            if log_hup {
                muxio_core::kwarn!("fd {} got POLLHUP", fd);
            }
            self.invoke_close();
        }
        if revents & nval != 0 {
            muxio_core::kwarn!("fd {} got POLLNVAL", fd);
        }
        if revents & (err | nval) != 0 {
            self.invoke_error();
        }
        if revents & rd != 0 {
            self.invoke_read(receive_time);
        }
        if revents & wr != 0 {
            self.invoke_write();
        }

        let pending = {
            let mut inner = self.inner.borrow_mut();
            inner.event_handling = false;
            std::mem::take(&mut inner.pending_remove)
        };
        if pending {
            self.remove_now();
        }
    }

    // Callbacks are taken out of the slot before the call and restored
    // after, so a callback may re-enter this channel (enable/disable
    // interest, replace another callback) without hitting the RefCell.
    fn invoke_read(&self, receive_time: Timestamp) {
        let cb = self.inner.borrow_mut().read_cb.take();
        if let Some(mut f) = cb {
            f(receive_time);
            let mut inner = self.inner.borrow_mut();
            if inner.read_cb.is_none() {
                inner.read_cb = Some(f);
            }
        }
    }

    fn invoke_write(&self) {
        let cb = self.inner.borrow_mut().write_cb.take();
        if let Some(mut f) = cb {
            f();
            let mut inner = self.inner.borrow_mut();
            if inner.write_cb.is_none() {
                inner.write_cb = Some(f);
            }
        }
    }

    fn invoke_close(&self) {
        let cb = self.inner.borrow_mut().close_cb.take();
        if let Some(mut f) = cb {
            f();
            let mut inner = self.inner.borrow_mut();
            if inner.close_cb.is_none() {
                inner.close_cb = Some(f);
            }
        }
    }

    fn invoke_error(&self) {
        let cb = self.inner.borrow_mut().error_cb.take();
        if let Some(mut f) = cb {
            f();
            let mut inner = self.inner.borrow_mut();
            if inner.error_cb.is_none() {
                inner.error_cb = Some(f);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            let inner = self.inner.borrow();
            debug_assert!(
                !inner.event_handling,
                "channel for fd {} dropped mid-dispatch",
                inner.fd
            );
        }
    }
}

pub(crate) fn events_to_string(events: u32) -> String {
    let mut out = String::new();
    let names: [(i16, &str); 7] = [
        (libc::POLLIN, "IN"),
        (libc::POLLPRI, "PRI"),
        (libc::POLLOUT, "OUT"),
        (libc::POLLHUP, "HUP"),
        (libc::POLLRDHUP, "RDHUP"),
        (libc::POLLERR, "ERR"),
        (libc::POLLNVAL, "NVAL"),
    ];
    for (bit, name) in names {
        if events & bit as u32 != 0 {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{name}");
        }
    }
    if out.is_empty() {
        out.push('-');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_to_string() {
        assert_eq!(events_to_string(0), "-");
        assert_eq!(events_to_string(libc::POLLIN as u32), "IN");
        assert_eq!(
            events_to_string((libc::POLLIN | libc::POLLOUT) as u32),
            "IN OUT"
        );
    }

    #[test]
    fn test_event_constants_disjoint() {
        assert_eq!(READ_EVENT & WRITE_EVENT, 0);
        assert_ne!(READ_EVENT, NONE_EVENT);
        assert_ne!(WRITE_EVENT, NONE_EVENT);
    }
}
