//! Readiness multiplexing backends.

use std::sync::Arc;
use std::time::Instant;

use crate::channel::Channel;

mod epoll;
mod poll;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

// Channel::index() values used by the epoll backend. The poll backend
// reuses the same slot as a position in its pollfd array.
pub(crate) const INDEX_ADDED: i32 = 1;
pub(crate) const INDEX_DELETED: i32 = 2;

/// A readiness-notification backend. All methods run on the owning loop's
/// thread.
pub(crate) trait Poller {
    /// Wait up to `timeout_ms` for events, append ready channels to
    /// `active`, and return the time the wait ended.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Register `channel` or sync its interest set with the backend.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Drop `channel` from the backend. Interest must already be empty.
    fn remove_channel(&mut self, channel: &Channel);

    /// Whether `channel` is currently registered here.
    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Pick the backend: epoll unless `SHOAL_USE_POLL` is set in the
/// environment.
pub(crate) fn new_default_poller() -> Box<dyn Poller> {
    if std::env::var_os("SHOAL_USE_POLL").is_some() {
        Box::new(PollPoller::new())
    } else {
        Box::new(EpollPoller::new())
    }
}
