//! Sorted timer set backed by a single `timerfd`.
//!
//! The descriptor is registered as a read channel on the owning loop and
//! rearmed to the earliest pending expiration after every mutation that
//! can change it. Cancellation during a firing pass is observed before a
//! repeating timer would be reinserted; it cannot stop the firing that is
//! already in progress.

use std::collections::{BTreeMap, HashSet};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::channel::{Channel, EventHandler};
use crate::event_loop::LoopHandle;
use crate::sockets;
use crate::timer::{Timer, TimerId};

// Never arm the descriptor for less than this; a zero it_value would
// disarm it entirely.
const MIN_ARM: Duration = Duration::from_micros(100);

struct TimerQueueInner {
    /// Firing order: earliest expiration first, ties broken by sequence.
    timers: BTreeMap<(Instant, u64), Timer>,
    /// Cancellation lookup: sequence to scheduled expiration.
    active: BTreeMap<u64, Instant>,
    /// Sequences cancelled while their callbacks run; consulted before
    /// reinsertion.
    canceling: HashSet<u64>,
    calling_expired: bool,
}

/// Per-loop timer multiplexer.
pub(crate) struct TimerQueue {
    loop_: LoopHandle,
    timer_fd: OwnedFd,
    channel: Arc<Channel>,
    inner: Mutex<TimerQueueInner>,
    self_weak: Weak<TimerQueue>,
}

impl TimerQueue {
    /// Create the queue and its descriptor; `start` registers the channel
    /// once the loop is able to accept registrations.
    pub(crate) fn new(loop_: LoopHandle) -> Arc<TimerQueue> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            panic!(
                "timerfd_create failed: {}",
                std::io::Error::last_os_error()
            );
        }
        let timer_fd = sockets::owned_from_raw(fd);
        let channel = Channel::new(loop_.clone(), timer_fd.as_raw_fd());
        Arc::new_cyclic(|self_weak| TimerQueue {
            loop_,
            timer_fd,
            channel,
            inner: Mutex::new(TimerQueueInner {
                timers: BTreeMap::new(),
                active: BTreeMap::new(),
                canceling: HashSet::new(),
                calling_expired: false,
            }),
            self_weak: self_weak.clone(),
        })
    }

    /// Register the timer channel with the loop. We read the descriptor
    /// permanently and disarm it with `timerfd_settime`.
    pub(crate) fn start(&self) {
        let weak: Weak<dyn EventHandler> = self.self_weak.clone();
        self.channel.set_handler(weak);
        self.channel.enable_reading();
    }

    /// Unregister the timer channel. Must run on the loop thread while the
    /// poller is still alive.
    pub(crate) fn shutdown(&self) {
        self.channel.disable_all();
        self.channel.remove();
    }

    pub(crate) fn add_timer_in_loop(&self, timer: Timer) {
        self.loop_.assert_in_loop_thread();
        let when = timer.expiration();
        let earliest_changed = {
            let mut guard = self.inner.lock();
            insert_locked(&mut guard, timer)
        };
        if earliest_changed {
            self.rearm(when);
        }
    }

    pub(crate) fn cancel_in_loop(&self, id: TimerId) {
        self.loop_.assert_in_loop_thread();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        debug_assert_eq!(inner.timers.len(), inner.active.len());
        if let Some(when) = inner.active.remove(&id.sequence()) {
            let removed = inner.timers.remove(&(when, id.sequence()));
            debug_assert!(removed.is_some());
        } else if inner.calling_expired {
            inner.canceling.insert(id.sequence());
        }
        debug_assert_eq!(inner.timers.len(), inner.active.len());
    }

    fn rearm(&self, when: Instant) {
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(MIN_ARM);
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let rc = unsafe {
            libc::timerfd_settime(
                self.timer_fd.as_raw_fd(),
                0,
                &new_value,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            error!("timerfd_settime failed: {}", std::io::Error::last_os_error());
        }
    }

    fn drain_descriptor(&self) {
        let mut count = [0u8; 8];
        match sockets::read(self.timer_fd.as_raw_fd(), &mut count) {
            Ok(8) => {
                trace!(expirations = u64::from_ne_bytes(count), "timerfd fired");
            }
            Ok(n) => error!("timerfd read returned {n} bytes instead of 8"),
            Err(e) => error!("timerfd read failed: {e}"),
        }
    }
}

fn insert_locked(inner: &mut TimerQueueInner, timer: Timer) -> bool {
    let when = timer.expiration();
    let earliest_changed = match inner.timers.keys().next() {
        Some(&(first, _)) => when < first,
        None => true,
    };
    inner.active.insert(timer.sequence(), when);
    inner.timers.insert((when, timer.sequence()), timer);
    debug_assert_eq!(inner.timers.len(), inner.active.len());
    earliest_changed
}

impl EventHandler for TimerQueue {
    fn handle_read(&self, _receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let now = Instant::now();
        self.drain_descriptor();

        let mut expired: Vec<Timer> = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            while let Some(entry) = inner.timers.first_entry() {
                if entry.key().0 > now {
                    break;
                }
                let ((_, sequence), timer) = entry.remove_entry();
                inner.active.remove(&sequence);
                expired.push(timer);
            }
            debug_assert_eq!(inner.timers.len(), inner.active.len());
            inner.calling_expired = true;
            inner.canceling.clear();
        }

        // Callbacks run without the lock so they can add or cancel timers.
        for timer in expired.iter_mut() {
            timer.run();
        }

        let next = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.calling_expired = false;
            for mut timer in expired {
                if timer.repeat() && !inner.canceling.contains(&timer.sequence()) {
                    timer.restart(now);
                    insert_locked(inner, timer);
                }
            }
            inner.timers.keys().next().map(|&(when, _)| when)
        };
        if let Some(when) = next {
            self.rearm(when);
        }
    }
}
