//! A thread whose entire body is one reactor.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::event_loop::{EventLoop, LoopHandle};

/// Callback run inside a worker thread after its loop is constructed and
/// before it starts polling.
pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// Owns a worker thread running an [`EventLoop`]. Dropping the value quits
/// the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    thread: Option<JoinHandle<()>>,
    loop_: Option<LoopHandle>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name: name.into(),
            init,
            thread: None,
            loop_: None,
        }
    }

    /// Spawn the thread and block until its loop is running enough to
    /// accept work. Returns the loop's handle.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "loop thread already started");

        let ready: Arc<(Mutex<Option<LoopHandle>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let publish = ready.clone();
        let init = self.init.clone();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new();
                if let Some(cb) = &init {
                    cb(&event_loop.handle());
                }
                {
                    let (slot, cvar) = &*publish;
                    *slot.lock() = Some(event_loop.handle());
                    cvar.notify_one();
                }
                event_loop.run();
            })
            .expect("failed to spawn loop thread");
        self.thread = Some(thread);

        let (slot, cvar) = &*ready;
        let mut guard = slot.lock();
        while guard.is_none() {
            cvar.wait(&mut guard);
        }
        let handle = guard.clone().expect("loop handle published");
        self.loop_ = Some(handle.clone());
        handle
    }

    /// Handle of the running loop, if started.
    pub fn loop_handle(&self) -> Option<&LoopHandle> {
        self.loop_.as_ref()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = &self.loop_ {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            debug!(name = %self.name, "joining loop thread");
            let _ = thread.join();
        }
    }
}
