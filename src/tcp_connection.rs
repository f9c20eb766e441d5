//! Per-connection state machine.
//!
//! A connection moves `Connecting -> Connected -> Disconnecting ->
//! Disconnected`, with every transition on its owning loop's thread.
//! The handle is `Arc`-shared between the server/client registry, queued
//! tasks, and the channel's weak tie; the connection object outlives its
//! last callback and is freed when the final owner lets go.

use std::any::Any;
use std::io;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::addr::InetAddr;
use crate::buffer::Buffer;
use crate::channel::{Channel, EventHandler};
use crate::event_loop::LoopHandle;
use crate::sockets::{self, Socket};

/// Fires when a connection finishes establishing and again when it goes
/// down; check [`TcpConnection::is_connected`] to tell which.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fires on the owning loop whenever bytes arrive. The callback decides
/// how much of the buffer to consume.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;

/// Fires once the entire queued output has been handed to the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fires when a send crosses the output-queue threshold; the argument is
/// the queued byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal: transfers ownership back to the server/client on close.
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Default output-queue threshold: 64 MiB.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

struct ConnInner {
    output_buffer: Buffer,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_mark_cb: Option<HighWaterMarkCallback>,
    close_cb: Option<CloseCallback>,
    context: Option<Box<dyn Any + Send>>,
}

/// One established (or establishing) TCP connection.
pub struct TcpConnection {
    loop_: LoopHandle,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddr,
    peer_addr: InetAddr,
    high_water_mark: AtomicUsize,
    // Input is its own lock so the message callback can borrow it while
    // send and friends take the main lock.
    input_buffer: Mutex<Buffer>,
    inner: Mutex<ConnInner>,
    self_weak: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Wrap an accepted or connected descriptor.
    ///
    /// Registers nothing: the server/client installs callbacks and then
    /// runs [`connect_established`](Self::connect_established) on the
    /// owning loop.
    pub fn new(
        loop_: LoopHandle,
        name: impl Into<String>,
        sock_fd: OwnedFd,
        local_addr: InetAddr,
        peer_addr: InetAddr,
    ) -> Arc<TcpConnection> {
        let name = name.into();
        let socket = Socket::from_owned(sock_fd);
        socket.set_keep_alive(true);
        let channel = Channel::new(loop_.clone(), socket.fd());
        debug!(name = %name, fd = socket.fd(), "TcpConnection created");
        Arc::new_cyclic(|self_weak| TcpConnection {
            loop_,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(true),
            socket,
            channel,
            local_addr,
            peer_addr,
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input_buffer: Mutex::new(Buffer::new()),
            inner: Mutex::new(ConnInner {
                output_buffer: Buffer::new(),
                connection_cb: Arc::new(default_connection_callback),
                message_cb: Arc::new(default_message_callback),
                write_complete_cb: None,
                high_water_mark_cb: None,
                close_cb: None,
                context: None,
            }),
            self_weak: self_weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> InetAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> InetAddr {
        self.peer_addr
    }

    /// The loop this connection lives on.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// Whether the read side is currently watched.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Bytes queued in the output buffer, not yet in the kernel.
    pub fn queued_output(&self) -> usize {
        self.inner.lock().output_buffer.readable_bytes()
    }

    /// Kernel TCP_INFO for this connection.
    pub fn tcp_info(&self) -> io::Result<libc::tcp_info> {
        self.socket.tcp_info()
    }

    /// Human-readable TCP_INFO summary for diagnostics.
    pub fn tcp_info_string(&self) -> io::Result<String> {
        self.socket.tcp_info_string()
    }

    /// TCP_NODELAY.
    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_nodelay(on);
    }

    /// Output-queue threshold for the high-water-mark callback.
    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Release);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.inner.lock().connection_cb = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.inner.lock().message_cb = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.inner.lock().write_complete_cb = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        self.inner.lock().high_water_mark_cb = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.inner.lock().close_cb = Some(cb);
    }

    /// Attach an opaque user value.
    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        self.inner.lock().context = Some(context);
    }

    /// Detach and return the user value, if any.
    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.lock().context.take()
    }

    /// Borrow the user value slot.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> R {
        f(&mut self.inner.lock().context)
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Queue `data` for the peer. Callable from any thread; dropped
    /// silently unless the connection is up. Off-thread callers pay one
    /// copy so the payload outlives them.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let me = self.clone();
            let owned = data.to_vec();
            self.loop_.queue_in_loop(move || me.send_in_loop(&owned));
        }
    }

    /// Like [`send`](Self::send), but moves the readable contents out of
    /// `buf` instead of copying; the caller's buffer is left drained.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        let data = buf.take();
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(&data);
        } else {
            let me = self.clone();
            self.loop_.queue_in_loop(move || me.send_in_loop(&data));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        let len = data.len();
        let mut remaining = len;
        let mut nwrote = 0usize;
        let mut fault = false;

        if self.state() == State::Disconnected {
            warn!(name = %self.name, "disconnected, give up writing");
            return;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // Nothing queued and not watching for writability: try the kernel
        // directly and only fall back to queueing the remainder.
        if !self.channel.is_writing() && inner.output_buffer.readable_bytes() == 0 {
            match sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = len - n;
                    if remaining == 0
                        && let Some(cb) = inner.write_complete_cb.clone()
                    {
                        let me = self.clone();
                        self.loop_.queue_in_loop(move || cb(&me));
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!(name = %self.name, "send_in_loop write failed: {e}");
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        debug_assert!(remaining <= len);
        if !fault && remaining > 0 {
            let old_len = inner.output_buffer.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= high_water_mark
                && old_len < high_water_mark
                && let Some(cb) = inner.high_water_mark_cb.clone()
            {
                let me = self.clone();
                let queued = old_len + remaining;
                self.loop_.queue_in_loop(move || cb(&me, queued));
            }
            inner.output_buffer.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-close: stop sending once the queued output drains. The read
    /// side stays open until the peer closes. Idempotent.
    pub fn shutdown(&self) {
        if self
            .state
            .compare_exchange(
                State::Connected as u8,
                State::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            // Queued tasks share ownership so teardown cannot outrun them.
            let Some(me) = self.self_weak.upgrade() else {
                return;
            };
            self.loop_.run_in_loop(move || me.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            // FIN goes out now; with writes still queued, handle_write
            // re-invokes this once the buffer drains.
            if let Err(e) = self.socket.shutdown_write() {
                error!(name = %self.name, "shutdown_write failed: {e}");
            }
        }
    }

    /// Tear the connection down without waiting for output to drain.
    /// Idempotent.
    pub fn force_close(&self) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let Some(me) = self.self_weak.upgrade() else {
                return;
            };
            self.loop_.queue_in_loop(move || {
                let state = me.state();
                if state == State::Connected || state == State::Disconnecting {
                    me.handle_close();
                }
            });
        }
    }

    /// [`force_close`](Self::force_close) after `delay`.
    pub fn force_close_with_delay(&self, delay: Duration) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let me = self.self_weak.clone();
            self.loop_.run_after(delay, move || {
                if let Some(conn) = me.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Resume watching the read side.
    pub fn start_read(&self) {
        let Some(me) = self.self_weak.upgrade() else {
            return;
        };
        self.loop_.run_in_loop(move || {
            if !me.reading.load(Ordering::Acquire) || !me.channel.is_reading() {
                me.channel.enable_reading();
                me.reading.store(true, Ordering::Release);
            }
        });
    }

    /// Stop watching the read side; bytes accumulate in the kernel.
    pub fn stop_read(&self) {
        let Some(me) = self.self_weak.upgrade() else {
            return;
        };
        self.loop_.run_in_loop(move || {
            if me.reading.load(Ordering::Acquire) || me.channel.is_reading() {
                me.channel.disable_reading();
                me.reading.store(false, Ordering::Release);
            }
        });
    }

    /// Final setup on the owning loop: tie the channel, watch for reads,
    /// and fire the connection callback. Called exactly once by the
    /// server/client after callbacks are installed.
    pub fn connect_established(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        let weak: Weak<dyn EventHandler> = self.self_weak.clone();
        self.channel.set_handler(weak);
        self.channel.enable_reading();

        let cb = self.inner.lock().connection_cb.clone();
        cb(self);
    }

    /// Final teardown on the owning loop after the server/client released
    /// its reference. Called exactly once; the channel leaves the poller
    /// here.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connected {
            // Direct destruction without handle_close (e.g. server drop).
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            let cb = self.inner.lock().connection_cb.clone();
            cb(self);
        }
        if self.channel.is_registered() {
            self.channel.remove();
        }
    }

    fn handle_close(&self) {
        self.loop_.assert_in_loop_thread();
        trace!(name = %self.name, state = ?self.state(), "handle_close");
        debug_assert!(matches!(
            self.state(),
            State::Connected | State::Disconnecting
        ));
        let Some(me) = self.self_weak.upgrade() else {
            return;
        };
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let (conn_cb, close_cb) = {
            let inner = self.inner.lock();
            (inner.connection_cb.clone(), inner.close_cb.clone())
        };
        conn_cb(&me);
        // Last: hands ownership back to the server/client registry.
        if let Some(cb) = close_cb {
            cb(&me);
        }
    }
}

impl EventHandler for TcpConnection {
    fn handle_read(&self, receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        let Some(me) = self.self_weak.upgrade() else {
            return;
        };
        let mut input = self.input_buffer.lock();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let cb = self.inner.lock().message_cb.clone();
                cb(&me, &mut input, receive_time);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(input);
                error!(name = %self.name, "handle_read failed: {e}");
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(fd = self.channel.fd(), "connection is down, no more writing");
            return;
        }
        let Some(me) = self.self_weak.upgrade() else {
            return;
        };
        let mut guard = self.inner.lock();
        match sockets::write(self.channel.fd(), guard.output_buffer.peek()) {
            Ok(n) => {
                guard.output_buffer.retrieve(n);
                if guard.output_buffer.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(cb) = guard.write_complete_cb.clone() {
                        let conn = me.clone();
                        self.loop_.queue_in_loop(move || cb(&conn));
                    }
                    drop(guard);
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => {
                error!(name = %self.name, "handle_write failed: {e}");
            }
        }
    }

    fn handle_close(&self) {
        TcpConnection::handle_close(self);
    }

    fn handle_error(&self) {
        let err = sockets::get_socket_error(self.channel.fd());
        error!(
            name = %self.name,
            "SO_ERROR = {err} {}",
            io::Error::from_raw_os_error(err)
        );
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            name = %self.name,
            fd = self.socket.fd(),
            state = ?self.state(),
            "TcpConnection destructs"
        );
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Logs connection up/down; installed when the user sets no connection
/// callback.
pub fn default_connection_callback(conn: &Arc<TcpConnection>) {
    debug!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.is_connected() { "UP" } else { "DOWN" },
    );
}

/// Discards incoming bytes; installed when the user sets no message
/// callback.
pub fn default_message_callback(_conn: &Arc<TcpConnection>, buf: &mut Buffer, _at: Instant) {
    buf.retrieve_all();
}
