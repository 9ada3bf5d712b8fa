//! epoll(7) backend. The channel's poller index doubles as a registry
//! state: `INDEX_NEW` (never seen), `INDEX_ADDED` (in the epoll set) and
//! `INDEX_DELETED` (known fd, currently EPOLL_CTL_DELed because interest
//! is empty). A deleted channel re-arms with EPOLL_CTL_ADD, not MOD.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use muxio_core::{kerror, kfatal, ktrace, kwarn, Timestamp};
use nix::errno::Errno;

use crate::channel::{
    events_to_string, Channel, WeakChannel, INDEX_ADDED, INDEX_DELETED, INDEX_NEW,
};
use crate::poller::Poller;

const INIT_EVENT_LIST_SIZE: usize = 16;

pub(crate) struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, WeakChannel>,
}

impl EpollPoller {
    pub(crate) fn new() -> EpollPoller {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            kfatal!("epoll_create1: {}", muxio_core::error::last_errno());
        }
        EpollPoller {
            epoll_fd,
            events: vec![
                libc::epoll_event { events: 0, u64: 0 };
                INIT_EVENT_LIST_SIZE
            ],
            channels: HashMap::new(),
        }
    }

    fn fill_active(&mut self, num_events: usize, active: &mut Vec<Channel>) {
        for event in &self.events[..num_events] {
            let fd = event.u64 as RawFd;
            match self.channels.get(&fd).and_then(WeakChannel::upgrade) {
                Some(channel) => {
                    channel.set_revents(event.events);
                    active.push(channel);
                }
                None => {
                    kwarn!("epoll reports fd {} with no live channel", fd);
                }
            }
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        ktrace!(
            "epoll_ctl op {} fd {} events {}",
            op_name(op),
            fd,
            events_to_string(channel.events())
        );
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) } < 0 {
            let errno = muxio_core::error::last_errno();
            if op == libc::EPOLL_CTL_DEL {
                kerror!("epoll_ctl DEL fd {}: {}", fd, errno);
            } else {
                kfatal!("epoll_ctl {} fd {}: {}", op_name(op), fd, errno);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Timestamp::now();
        if n > 0 {
            let num_events = n as usize;
            ktrace!("{} event(s) happened", num_events);
            self.fill_active(num_events, active);
            if num_events == self.events.len() {
                self.events.resize(
                    num_events * 2,
                    libc::epoll_event { events: 0, u64: 0 },
                );
            }
        } else if n == 0 {
            ktrace!("nothing happened");
        } else {
            let errno = muxio_core::error::last_errno();
            if errno != Errno::EINTR {
                kerror!("epoll_wait: {}", errno);
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        let index = channel.index();
        let fd = channel.fd();
        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.downgrade());
            } else {
                assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(INDEX_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self.channels.contains_key(&fd));
            assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DELETED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let index = channel.index();
        assert!(index == INDEX_ADDED || index == INDEX_DELETED);
        self.channels.remove(&fd);
        if index == INDEX_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .and_then(WeakChannel::upgrade)
            .is_some_and(|held| held.ptr_eq(channel))
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "???",
    }
}
