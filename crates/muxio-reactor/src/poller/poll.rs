//! poll(2) backend. The channel's poller index is its slot in the pollfd
//! array. An interest-free channel stays in the array with its fd negated
//! (minus one extra, so fd 0 still negates) to keep the slot ignorable by
//! the kernel but recognizable on removal.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use muxio_core::{kerror, ktrace, Timestamp};
use nix::errno::Errno;

use crate::channel::{Channel, WeakChannel, INDEX_NEW};
use crate::poller::Poller;

pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, WeakChannel>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active(&self, mut budget: usize, active: &mut Vec<Channel>) {
        for pfd in &self.pollfds {
            if budget == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            budget -= 1;
            match self.channels.get(&pfd.fd).and_then(WeakChannel::upgrade) {
                Some(channel) => {
                    channel.set_revents(pfd.revents as u32);
                    active.push(channel);
                }
                None => kerror!("poll reports fd {} with no live channel", pfd.fd),
            }
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Channel>) -> Timestamp {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Timestamp::now();
        if n > 0 {
            ktrace!("{} event(s) happened", n);
            self.fill_active(n as usize, active);
        } else if n == 0 {
            ktrace!("nothing happened");
        } else {
            let errno = muxio_core::error::last_errno();
            if errno != Errno::EINTR {
                kerror!("poll: {}", errno);
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        ktrace!("poll update fd {} events {}", fd, channel.events());
        if channel.index() < 0 {
            // New channel: append a slot.
            assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: channel.events() as i16,
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(fd, channel.downgrade());
        } else {
            assert!(self.channels.contains_key(&fd));
            let index = channel.index() as usize;
            assert!(index < self.pollfds.len());
            let pfd = &mut self.pollfds[index];
            assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.fd = fd;
            pfd.events = channel.events() as i16;
            pfd.revents = 0;
            if channel.is_none_event() {
                pfd.fd = -fd - 1;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        ktrace!("poll remove fd {}", fd);
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let index = channel.index() as usize;
        assert!(index < self.pollfds.len());
        assert_eq!(self.pollfds[index].fd, -fd - 1);
        self.channels.remove(&fd);

        let last = self.pollfds.len() - 1;
        if index != last {
            // Swap-remove: patch the moved channel's index.
            let moved_fd = self.pollfds[last].fd;
            let real_fd = if moved_fd < 0 { -moved_fd - 1 } else { moved_fd };
            self.pollfds.swap(index, last);
            if let Some(moved) = self.channels.get(&real_fd).and_then(WeakChannel::upgrade) {
                moved.set_index(index as i32);
            }
        }
        self.pollfds.pop();
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .and_then(WeakChannel::upgrade)
            .is_some_and(|held| held.ptr_eq(channel))
    }
}
