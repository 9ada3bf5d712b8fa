//! Poller backends. `EpollPoller` is the default; set `MUXIO_USE_POLL`
//! to fall back to poll(2).
//!
//! A poller holds only weak references to its channels. The fd's owner
//! keeps the strong reference and is responsible for disabling interest
//! and calling `Channel::remove` before dropping it.

use muxio_core::Timestamp;

use crate::channel::Channel;

pub mod epoll;
pub mod poll;

pub(crate) trait Poller {
    /// Wait for events, fill `active` with the channels that have some,
    /// and return the time the wait finished.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp;

    fn update_channel(&mut self, channel: &Channel);

    fn remove_channel(&mut self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

pub(crate) fn new_default_poller() -> Box<dyn Poller> {
    if std::env::var_os("MUXIO_USE_POLL").is_some() {
        Box::new(poll::PollPoller::new())
    } else {
        Box::new(epoll::EpollPoller::new())
    }
}
