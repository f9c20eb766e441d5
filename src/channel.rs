//! Binding of one descriptor to its interest set and event handler.
//!
//! A `Channel` never owns its descriptor; the component that created it
//! (connection, acceptor, connector, timer queue, wakeup) does. All
//! channel operations happen on the owning loop's thread.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::event_loop::LoopHandle;

/// Readiness dispatch target of a [`Channel`].
///
/// The default methods make read-only handlers (timer queue, wakeup)
/// one-liners. Handlers are held weakly by the channel: dispatch upgrades
/// the reference for the duration of the callbacks and becomes a no-op
/// once the owner is gone, which is what lets a connection tear down while
/// its descriptor still has queued events.
pub trait EventHandler: Send + Sync {
    /// The descriptor is readable. `receive_time` is the poll return time.
    fn handle_read(&self, receive_time: Instant);

    /// The descriptor is writable.
    fn handle_write(&self) {}

    /// The peer hung up.
    fn handle_close(&self) {}

    /// The descriptor is in an error state.
    fn handle_error(&self) {}
}

pub(crate) const READ_EVENT: u32 = (libc::POLLIN | libc::POLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::POLLOUT as u32;
const NONE_EVENT: u32 = 0;

const HUP: u32 = libc::POLLHUP as u32;
const IN: u32 = libc::POLLIN as u32;
const PRI: u32 = libc::POLLPRI as u32;
const OUT: u32 = libc::POLLOUT as u32;
const ERR: u32 = libc::POLLERR as u32;
const NVAL: u32 = libc::POLLNVAL as u32;
const RDHUP: u32 = libc::POLLRDHUP as u32;

/// A descriptor's registration with its owning loop.
pub struct Channel {
    loop_: LoopHandle,
    fd: RawFd,
    events: AtomicU32,
    revents: AtomicU32,
    // Poller bookkeeping: registration state for epoll, array position
    // for poll(2).
    index: AtomicI32,
    handler: Mutex<Option<Weak<dyn EventHandler>>>,
    event_handling: AtomicBool,
    added_to_loop: AtomicBool,
    self_weak: Weak<Channel>,
}

pub(crate) const INDEX_NEW: i32 = -1;

impl Channel {
    /// Create an unregistered channel for `fd` on the given loop.
    pub fn new(loop_: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            loop_,
            fd,
            events: AtomicU32::new(NONE_EVENT),
            revents: AtomicU32::new(NONE_EVENT),
            index: AtomicI32::new(INDEX_NEW),
            handler: Mutex::new(None),
            event_handling: AtomicBool::new(false),
            added_to_loop: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn events(&self) -> u32 {
        self.events.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    #[inline]
    pub(crate) fn index(&self) -> i32 {
        self.index.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_index(&self, index: i32) {
        self.index.store(index, Ordering::Release);
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.events() == NONE_EVENT
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    /// The loop this channel is registered with.
    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    /// Install the dispatch target. The reference is weak; see
    /// [`EventHandler`].
    pub fn set_handler(&self, handler: Weak<dyn EventHandler>) {
        *self.handler.lock() = Some(handler);
    }

    pub fn enable_reading(&self) {
        self.events.fetch_or(READ_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.events.fetch_and(!READ_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.events.fetch_or(WRITE_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.store(NONE_EVENT, Ordering::Release);
        self.update();
    }

    fn update(&self) {
        self.added_to_loop.store(true, Ordering::Release);
        let me = match self.self_weak.upgrade() {
            Some(me) => me,
            None => return,
        };
        self.loop_.update_channel(&me);
    }

    /// Whether the channel has ever been handed to the poller and not yet
    /// removed.
    pub fn is_registered(&self) -> bool {
        self.added_to_loop.load(Ordering::Acquire)
    }

    /// Unregister from the poller. Requires all interest disabled first.
    pub fn remove(&self) {
        assert!(self.is_none_event());
        self.added_to_loop.store(false, Ordering::Release);
        self.loop_.remove_channel(self);
    }

    /// Dispatch the ready events reported by the poller.
    ///
    /// Order: hangup-without-data closes, invalid descriptors warn, error
    /// states report, then read, then write.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        let handler = self.handler.lock().as_ref().and_then(Weak::upgrade);
        let Some(handler) = handler else {
            // Owner already torn down; the events die here.
            trace!(fd = self.fd, "channel owner gone, dropping events");
            return;
        };

        self.event_handling.store(true, Ordering::Release);
        let revents = self.revents.load(Ordering::Acquire);
        trace!(fd = self.fd, revents, "handle_event");

        if revents & HUP != 0 && revents & IN == 0 {
            warn!(fd = self.fd, "POLLHUP");
            handler.handle_close();
        }
        if revents & NVAL != 0 {
            warn!(fd = self.fd, "POLLNVAL");
        }
        if revents & (ERR | NVAL) != 0 {
            handler.handle_error();
        }
        if revents & (IN | PRI | RDHUP) != 0 {
            handler.handle_read(receive_time);
        }
        if revents & OUT != 0 {
            handler.handle_write();
        }
        self.event_handling.store(false, Ordering::Release);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.load(Ordering::Acquire));
        debug_assert!(!self.added_to_loop.load(Ordering::Acquire));
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events())
            .finish_non_exhaustive()
    }
}
