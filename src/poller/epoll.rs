//! `epoll`-based poller.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, trace};

use super::{INDEX_ADDED, INDEX_DELETED, Poller};
use crate::channel::{Channel, INDEX_NEW};
use crate::sockets;

const INIT_EVENT_LIST_SIZE: usize = 16;

// The channel layer stores poll(2) bits; they are numerically identical
// to the epoll bits, so they pass through unconverted.
const _: () = {
    assert!(libc::EPOLLIN == libc::POLLIN as i32);
    assert!(libc::EPOLLPRI == libc::POLLPRI as i32);
    assert!(libc::EPOLLOUT == libc::POLLOUT as i32);
    assert!(libc::EPOLLRDHUP == libc::POLLRDHUP as i32);
    assert!(libc::EPOLLERR == libc::POLLERR as i32);
    assert!(libc::EPOLLHUP == libc::POLLHUP as i32);
};

pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> EpollPoller {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            panic!("epoll_create1 failed: {}", io::Error::last_os_error());
        }
        EpollPoller {
            epoll_fd: sockets::owned_from_raw(fd),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        }
    }

    fn fill_active(&self, count: usize, active: &mut Vec<Arc<Channel>>) {
        for event in &self.events[..count] {
            let fd = event.u64 as RawFd;
            let Some(channel) = self.channels.get(&fd) else {
                debug_assert!(false, "event for unknown fd {fd}");
                continue;
            };
            channel.set_revents(event.events);
            active.push(channel.clone());
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd, "epoll_ctl del failed: {err}");
            } else {
                panic!("epoll_ctl op {op} on fd {fd} failed: {err}");
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Instant::now();
        if n > 0 {
            trace!(events = n, "epoll_wait");
            self.fill_active(n as usize, active);
            if n as usize == self.events.len() {
                // Full return: grow so a burst is drained in fewer calls.
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if n == 0 {
            trace!("epoll_wait timed out");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!("epoll_wait failed: {saved}");
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        let fd = channel.fd();
        trace!(fd, events = channel.events(), index, "update channel");
        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                debug_assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                debug_assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(INDEX_ADDED);
            self.ctl(libc::EPOLL_CTL_ADD, fd, channel.events());
        } else {
            debug_assert!(self.channels.contains_key(&fd));
            debug_assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
                channel.set_index(INDEX_DELETED);
            } else {
                self.ctl(libc::EPOLL_CTL_MOD, fd, channel.events());
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!(fd, "remove channel");
        debug_assert!(self.has_channel(channel));
        debug_assert!(channel.is_none_event());
        let index = channel.index();
        debug_assert!(index == INDEX_ADDED || index == INDEX_DELETED);
        self.channels.remove(&fd);
        if index == INDEX_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
    }
}
