//! Per-thread reactor.
//!
//! An [`EventLoop`] is bound to the thread that created it: its poller,
//! timer queue, and registered channels are only ever touched from that
//! thread. Everything other threads need goes through a [`LoopHandle`],
//! which posts closures to the loop and kicks it out of `poll` through an
//! eventfd.
//!
//! At most one reactor may exist per thread; constructing a second one
//! panics.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::channel::{Channel, EventHandler};
use crate::poller::{self, Poller};
use crate::sockets;
use crate::timer::{Timer, TimerId};
use crate::timer_queue::TimerQueue;

const POLL_TIMEOUT_MS: i32 = 10_000;

/// A closure posted to a loop from an arbitrary thread.
pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Rc<LoopInner>>> = const { RefCell::new(None) };
}

// A broken pipe must surface as EPIPE on the write path, not kill the
// process.
fn ignore_sigpipe() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// State shared between a loop and every handle to it.
struct LoopShared {
    thread_id: ThreadId,
    wakeup_fd: OwnedFd,
    pending: Mutex<Vec<Task>>,
    quit: AtomicBool,
    calling_pending: AtomicBool,
}

/// Cheap, clonable, `Send` handle to an [`EventLoop`].
///
/// The handle owns the wakeup descriptor, so `wakeup` and `quit` are safe
/// to call even while the loop itself is tearing down.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// True when the calling thread is the loop's thread.
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Panic unless called on the loop's thread.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop of thread {:?} used from thread {:?}",
            self.shared.thread_id,
            thread::current().id(),
        );
    }

    /// True when `other` refers to the same loop.
    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `task` on the loop thread: immediately when already there,
    /// otherwise via [`queue_in_loop`](Self::queue_in_loop).
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the loop thread.
    ///
    /// The loop is woken when the caller is off-thread, and also when the
    /// loop is currently draining its queue, so a task enqueued from
    /// inside another task runs in the next iteration instead of waiting
    /// out a full poll timeout.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.pending.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Number of queued tasks.
    pub fn queue_size(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Kick the loop out of `poll`.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        match sockets::write(self.shared.wakeup_fd.as_raw_fd(), &one.to_ne_bytes()) {
            Ok(8) => {}
            Ok(n) => error!("wakeup write returned {n} bytes instead of 8"),
            Err(e) => error!("wakeup write failed: {e}"),
        }
    }

    /// Ask the loop to exit after the current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `cb` once at `when`.
    pub fn run_at(&self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Timer::new(Box::new(cb), when, None))
    }

    /// Run `cb` once after `delay`.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Timer::new(Box::new(cb), Instant::now() + delay, None))
    }

    /// Run `cb` every `interval`, starting one interval from now.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(Timer::new(
            Box::new(cb),
            Instant::now() + interval,
            Some(interval),
        ))
    }

    fn schedule(&self, timer: Timer) -> TimerId {
        let id = timer.id();
        let me = self.clone();
        self.run_in_loop(move || {
            with_current(&me, |inner| inner.timer_queue.add_timer_in_loop(timer));
        });
        id
    }

    /// Cancel a scheduled timer. Best-effort while its callback is firing:
    /// the in-progress run completes but a repeating timer is not
    /// reinserted.
    pub fn cancel(&self, id: TimerId) {
        let me = self.clone();
        self.run_in_loop(move || {
            with_current(&me, |inner| inner.timer_queue.cancel_in_loop(id));
        });
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        with_current(self, |inner| {
            inner.poller.borrow_mut().update_channel(channel);
        });
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        with_current(self, |inner| inner.remove_channel(channel));
    }

    /// Whether `channel` is registered with this loop's poller.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        with_current(self, |inner| inner.poller.borrow().has_channel(channel))
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread_id", &self.shared.thread_id)
            .finish_non_exhaustive()
    }
}

/// Run `f` against the reactor of the current thread, asserting it is the
/// one `handle` refers to.
fn with_current<R>(handle: &LoopHandle, f: impl FnOnce(&LoopInner) -> R) -> R {
    CURRENT_LOOP.with(|current| {
        let borrowed = current.borrow();
        let inner = borrowed
            .as_ref()
            .unwrap_or_else(|| panic!("no EventLoop running in thread {:?}", thread::current().id()));
        debug_assert!(handle.same_loop(&inner.handle));
        f(inner)
    })
}

struct LoopInner {
    handle: LoopHandle,
    poller: RefCell<Box<dyn Poller>>,
    timer_queue: Arc<TimerQueue>,
    wakeup_channel: Arc<Channel>,
    // Keeps the wakeup handler upgradable for the channel's weak tie.
    _wakeup_handler: Arc<WakeupHandler>,
    active_channels: RefCell<Vec<Arc<Channel>>>,
    current_active_fd: Cell<Option<RawFd>>,
    event_handling: Cell<bool>,
    looping: Cell<bool>,
    iteration: Cell<u64>,
    poll_return_time: Cell<Instant>,
    context: RefCell<Option<Box<dyn Any + Send>>>,
}

impl LoopInner {
    fn remove_channel(&self, channel: &Channel) {
        if self.event_handling.get() {
            // Only the channel being dispatched, or one that is not in
            // this iteration's active list, may be removed mid-dispatch.
            let is_current = self.current_active_fd.get() == Some(channel.fd());
            let in_active = self
                .active_channels
                .borrow()
                .iter()
                .any(|c| c.fd() == channel.fd());
            assert!(is_current || !in_active);
        }
        self.poller.borrow_mut().remove_channel(channel);
    }
}

/// Drains the wakeup eventfd.
struct WakeupHandler {
    fd: RawFd,
}

impl EventHandler for WakeupHandler {
    fn handle_read(&self, _receive_time: Instant) {
        let mut count = [0u8; 8];
        match sockets::read(self.fd, &mut count) {
            Ok(8) => {}
            Ok(n) => error!("wakeup read returned {n} bytes instead of 8"),
            Err(e) => error!("wakeup read failed: {e}"),
        }
    }
}

/// One-loop-per-thread reactor: polls for readiness, dispatches channel
/// events, expires timers, and runs posted tasks.
pub struct EventLoop {
    inner: Rc<LoopInner>,
    // Loops have thread affinity; keep the type out of Send/Sync.
    _not_send: PhantomData<*const ()>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create the reactor for the current thread.
    ///
    /// The backend is epoll unless the `SHOAL_USE_POLL` environment
    /// variable is set.
    ///
    /// # Panics
    ///
    /// Panics if this thread already runs a reactor, or if the wakeup or
    /// timer descriptors cannot be created.
    pub fn new() -> EventLoop {
        Self::with_poller(poller::new_default_poller())
    }

    pub(crate) fn with_poller(poller: Box<dyn Poller>) -> EventLoop {
        ignore_sigpipe();

        CURRENT_LOOP.with(|current| {
            if current.borrow().is_some() {
                panic!(
                    "another EventLoop already exists in thread {:?}",
                    thread::current().id()
                );
            }
        });

        let wakeup_fd = create_eventfd();
        let shared = Arc::new(LoopShared {
            thread_id: thread::current().id(),
            wakeup_fd,
            pending: Mutex::new(Vec::new()),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
        });
        let handle = LoopHandle { shared };

        let timer_queue = TimerQueue::new(handle.clone());
        let wakeup_raw = handle.shared.wakeup_fd.as_raw_fd();
        let wakeup_channel = Channel::new(handle.clone(), wakeup_raw);
        let wakeup_handler = Arc::new(WakeupHandler { fd: wakeup_raw });

        let inner = Rc::new(LoopInner {
            handle: handle.clone(),
            poller: RefCell::new(poller),
            timer_queue,
            wakeup_channel,
            _wakeup_handler: wakeup_handler.clone(),
            active_channels: RefCell::new(Vec::new()),
            current_active_fd: Cell::new(None),
            event_handling: Cell::new(false),
            looping: Cell::new(false),
            iteration: Cell::new(0),
            poll_return_time: Cell::new(Instant::now()),
            context: RefCell::new(None),
        });

        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = Some(inner.clone());
        });

        // Registration goes through the thread-local slot, so it has to
        // happen after the slot is filled.
        let weak_wakeup: Weak<WakeupHandler> = Arc::downgrade(&wakeup_handler);
        let weak: Weak<dyn EventHandler> = weak_wakeup;
        inner.wakeup_channel.set_handler(weak);
        inner.wakeup_channel.enable_reading();
        inner.timer_queue.start();

        debug!(thread = ?thread::current().id(), "EventLoop created");
        EventLoop {
            inner,
            _not_send: PhantomData,
        }
    }

    /// Handle for cross-thread use.
    pub fn handle(&self) -> LoopHandle {
        self.inner.handle.clone()
    }

    /// Completed poll iterations.
    pub fn iteration(&self) -> u64 {
        self.inner.iteration.get()
    }

    /// When the current iteration's `poll` returned.
    pub fn poll_return_time(&self) -> Instant {
        self.inner.poll_return_time.get()
    }

    /// Attach an opaque user value to the loop.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.inner.context.borrow_mut() = Some(context);
    }

    /// Detach and return the user value, if any.
    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.context.borrow_mut().take()
    }

    /// Borrow the user value slot.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> R {
        f(&mut self.inner.context.borrow_mut())
    }

    /// Run the reactor until [`LoopHandle::quit`] is called.
    ///
    /// Each iteration polls for readiness (bounded by a 10 s timeout and
    /// by wakeups), dispatches ready channels, then drains the task
    /// queue.
    pub fn run(&self) {
        let inner = &self.inner;
        let handle = &inner.handle;
        assert!(!inner.looping.get());
        handle.assert_in_loop_thread();
        inner.looping.set(true);
        // The quit flag is not reset here: a quit that lands between
        // construction and run() must still stop the loop, or a joining
        // owner would hang.
        debug!("EventLoop start looping");

        while !handle.shared.quit.load(Ordering::Acquire) {
            {
                let mut active = inner.active_channels.borrow_mut();
                active.clear();
                let ts = inner.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active);
                inner.poll_return_time.set(ts);
            }
            inner.iteration.set(inner.iteration.get() + 1);
            trace!(
                iteration = inner.iteration.get(),
                active = inner.active_channels.borrow().len(),
                "poll returned"
            );

            inner.event_handling.set(true);
            let count = inner.active_channels.borrow().len();
            for i in 0..count {
                let channel = inner.active_channels.borrow()[i].clone();
                inner.current_active_fd.set(Some(channel.fd()));
                channel.handle_event(inner.poll_return_time.get());
            }
            inner.current_active_fd.set(None);
            inner.event_handling.set(false);

            self.do_pending_tasks();
        }

        inner.looping.set(false);
        debug!("EventLoop stop looping");
    }

    // Swap the queue out under the lock and run the tasks unlocked: a
    // task may post more tasks, and producers must never block on a
    // running callback.
    fn do_pending_tasks(&self) {
        let shared = &self.inner.handle.shared;
        shared.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *shared.pending.lock());
        for task in tasks {
            task();
        }
        shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!(thread = ?thread::current().id(), "EventLoop destructs");
        if !self.inner.handle.is_in_loop_thread() {
            warn!("EventLoop dropped off its own thread");
        }
        self.inner.timer_queue.shutdown();
        self.inner.wakeup_channel.disable_all();
        self.inner.wakeup_channel.remove();
        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = None;
        });
    }
}

fn create_eventfd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        panic!("eventfd failed: {}", std::io::Error::last_os_error());
    }
    sockets::owned_from_raw(fd)
}
