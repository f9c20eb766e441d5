//! Pool of worker reactors plus the caller's base loop.

use tracing::debug;

use crate::event_loop::LoopHandle;
use crate::event_loop_thread::{EventLoopThread, ThreadInitCallback};

/// Spawns N worker loops and hands them out round-robin or by hash.
/// With zero workers every query falls back to the base loop.
pub struct EventLoopThreadPool {
    base_loop: LoopHandle,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: LoopHandle, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Number of worker loops to spawn at [`start`](Self::start).
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Spawn the workers. `init` runs inside each worker before it polls;
    /// with zero workers it runs synchronously on the base loop.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started);
        self.base_loop.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let name = format!("{}{}", self.name, i);
            debug!(name = %name, "starting pool thread");
            let mut thread = EventLoopThread::new(name, init.clone());
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }
        if self.num_threads == 0
            && let Some(cb) = init
        {
            cb(&self.base_loop);
        }
    }

    /// Next worker loop, round-robin; the base loop when there are none.
    pub fn get_next_loop(&mut self) -> LoopHandle {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started);
        if self.loops.is_empty() {
            self.base_loop.clone()
        } else {
            let picked = self.loops[self.next].clone();
            self.next = (self.next + 1) % self.loops.len();
            picked
        }
    }

    /// Deterministic worker for `hash`; the base loop when there are none.
    pub fn get_loop_for_hash(&self, hash: usize) -> LoopHandle {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started);
        if self.loops.is_empty() {
            self.base_loop.clone()
        } else {
            self.loops[hash % self.loops.len()].clone()
        }
    }

    /// Every loop in the pool; just the base loop when there are none.
    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
