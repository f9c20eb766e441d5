//! `poll(2)`-based poller.
//!
//! Channels carry their position in the densely packed pollfd array in
//! their `index` slot. Entries with all interest disabled stay in the
//! array with a negated descriptor, which the kernel skips.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, trace};

use super::Poller;
use crate::channel::{Channel, INDEX_NEW};

pub(crate) struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

// fd slot value that makes the kernel ignore an entry but stays
// recoverable.
fn ignored(fd: RawFd) -> RawFd {
    -fd - 1
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active(&self, mut remaining: usize, active: &mut Vec<Arc<Channel>>) {
        for pfd in &self.pollfds {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            let Some(channel) = self.channels.get(&pfd.fd) else {
                debug_assert!(false, "revents for unknown fd {}", pfd.fd);
                continue;
            };
            channel.set_revents(pfd.revents as u16 as u32);
            active.push(channel.clone());
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Instant::now();
        if n > 0 {
            trace!(events = n, "poll");
            self.fill_active(n as usize, active);
        } else if n == 0 {
            trace!("poll timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("poll failed: {saved}");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!(fd, events = channel.events(), "update channel");
        if channel.index() < 0 {
            debug_assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: channel.events() as i16,
                revents: 0,
            });
            channel.set_index((self.pollfds.len() - 1) as i32);
            self.channels.insert(fd, channel.clone());
        } else {
            debug_assert!(self.channels.contains_key(&fd));
            let index = channel.index() as usize;
            debug_assert!(index < self.pollfds.len());
            let pfd = &mut self.pollfds[index];
            debug_assert!(pfd.fd == fd || pfd.fd == ignored(fd));
            pfd.fd = fd;
            pfd.events = channel.events() as i16;
            pfd.revents = 0;
            if channel.is_none_event() {
                pfd.fd = ignored(fd);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!(fd, "remove channel");
        debug_assert!(self.has_channel(channel));
        debug_assert!(channel.is_none_event());
        let index = channel.index() as usize;
        debug_assert!(index < self.pollfds.len());
        debug_assert_eq!(self.pollfds[index].fd, ignored(fd));
        self.channels.remove(&fd);

        let last = self.pollfds.len() - 1;
        if index != last {
            self.pollfds.swap(index, last);
            let mut moved_fd = self.pollfds[index].fd;
            if moved_fd < 0 {
                moved_fd = ignored(moved_fd);
            }
            if let Some(moved) = self.channels.get(&moved_fd) {
                moved.set_index(index as i32);
            } else {
                debug_assert!(false, "swapped pollfd {moved_fd} has no channel");
            }
        }
        self.pollfds.pop();
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
    }
}
