//! Non-blocking outbound connect with exponential-backoff retry.

use std::io;
use std::os::unix::io::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::addr::InetAddr;
use crate::channel::{Channel, EventHandler};
use crate::event_loop::LoopHandle;
use crate::sockets::{self, Socket};

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Disconnected,
            1 => State::Connecting,
            _ => State::Connected,
        }
    }
}

/// Receives the connected descriptor; ownership transfers to the callback.
pub type ConnectedCallback = Box<dyn FnMut(OwnedFd) + Send>;

struct ConnectorInner {
    // The in-flight socket. The channel watches its descriptor but never
    // owns it.
    socket: Option<Socket>,
    channel: Option<Arc<Channel>>,
    retry_delay: Duration,
    connected_cb: Option<ConnectedCallback>,
}

/// Drives one endpoint's connect attempts on its loop.
///
/// Start/stop may be called from any thread; the state machine itself
/// only moves on the loop thread.
pub struct Connector {
    loop_: LoopHandle,
    server_addr: InetAddr,
    connect_flag: AtomicBool,
    state: AtomicU8,
    inner: Mutex<ConnectorInner>,
    self_weak: Weak<Connector>,
}

impl Connector {
    pub fn new(loop_: LoopHandle, server_addr: InetAddr) -> Arc<Connector> {
        Arc::new_cyclic(|self_weak| Connector {
            loop_,
            server_addr,
            connect_flag: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            inner: Mutex::new(ConnectorInner {
                socket: None,
                channel: None,
                retry_delay: INIT_RETRY_DELAY,
                connected_cb: None,
            }),
            self_weak: self_weak.clone(),
        })
    }

    pub fn set_connected_callback(&self, cb: ConnectedCallback) {
        self.inner.lock().connected_cb = Some(cb);
    }

    pub fn server_addr(&self) -> InetAddr {
        self.server_addr
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Begin connecting (from any thread).
    pub fn start(&self) {
        self.connect_flag.store(true, Ordering::Release);
        let me = self.self_weak.clone();
        self.loop_.run_in_loop(move || {
            if let Some(c) = me.upgrade() {
                c.start_in_loop();
            }
        });
    }

    /// Abandon the current attempt and any scheduled retry (from any
    /// thread).
    pub fn stop(&self) {
        self.connect_flag.store(false, Ordering::Release);
        let me = self.self_weak.clone();
        self.loop_.queue_in_loop(move || {
            if let Some(c) = me.upgrade() {
                c.stop_in_loop();
            }
        });
    }

    /// Reset backoff and reconnect. Loop thread only.
    pub fn restart(&self) {
        self.loop_.assert_in_loop_thread();
        self.set_state(State::Disconnected);
        self.inner.lock().retry_delay = INIT_RETRY_DELAY;
        self.connect_flag.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn start_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(self.state(), State::Disconnected);
        if self.connect_flag.load(Ordering::Acquire) {
            self.connect();
        } else {
            debug!("connector stopped before start");
        }
    }

    fn stop_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            if let Some(socket) = self.remove_and_reset_channel() {
                self.retry(socket);
            }
        }
    }

    fn connect(&self) {
        let socket = Socket::new_nonblocking(self.server_addr.is_ipv6())
            .expect("failed to create connector socket");
        let result = socket.connect(&self.server_addr);
        let errno = match &result {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(0),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(socket),

            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(socket),

            libc::EACCES
            | libc::EPERM
            | libc::EAFNOSUPPORT
            | libc::EALREADY
            | libc::EBADF
            | libc::EFAULT
            | libc::ENOTSOCK => {
                error!(errno, addr = %self.server_addr, "connect error, giving up");
            }

            _ => {
                error!(errno, addr = %self.server_addr, "unexpected connect error, giving up");
            }
        }
    }

    fn connecting(&self, socket: Socket) {
        self.set_state(State::Connecting);
        let channel = Channel::new(self.loop_.clone(), socket.fd());
        let weak: Weak<dyn EventHandler> = self.self_weak.clone();
        channel.set_handler(weak);
        {
            let mut inner = self.inner.lock();
            debug_assert!(inner.channel.is_none());
            inner.socket = Some(socket);
            inner.channel = Some(channel.clone());
        }
        channel.enable_writing();
    }

    // Detach the channel from the poller and reclaim the socket. The
    // channel object itself may still be on the dispatch stack; the Arc
    // keeps it alive until that unwinds.
    fn remove_and_reset_channel(&self) -> Option<Socket> {
        let (socket, channel) = {
            let mut inner = self.inner.lock();
            (inner.socket.take(), inner.channel.take())
        };
        if let Some(channel) = channel {
            channel.disable_all();
            channel.remove();
        }
        socket
    }

    fn retry(&self, socket: Socket) {
        drop(socket);
        self.set_state(State::Disconnected);
        if self.connect_flag.load(Ordering::Acquire) {
            let delay = {
                let mut inner = self.inner.lock();
                let delay = inner.retry_delay;
                inner.retry_delay = (delay * 2).min(MAX_RETRY_DELAY);
                delay
            };
            info!(addr = %self.server_addr, ?delay, "retrying connect");
            let me = self.self_weak.clone();
            self.loop_.run_after(delay, move || {
                if let Some(c) = me.upgrade() {
                    c.start_in_loop();
                }
            });
        } else {
            debug!("connector stopped, not retrying");
        }
    }
}

impl EventHandler for Connector {
    fn handle_read(&self, _receive_time: Instant) {
        // Interest is write-only while connecting.
    }

    fn handle_write(&self) {
        trace!(state = ?self.state(), "connector writable");
        if self.state() != State::Connecting {
            return;
        }
        let Some(socket) = self.remove_and_reset_channel() else {
            return;
        };
        let err = sockets::get_socket_error(socket.fd());
        if err != 0 {
            warn!(
                "SO_ERROR = {err} {}",
                io::Error::from_raw_os_error(err)
            );
            self.retry(socket);
        } else if sockets::is_self_connect(socket.fd()) {
            warn!("self connect");
            self.retry(socket);
        } else {
            self.set_state(State::Connected);
            if self.connect_flag.load(Ordering::Acquire) {
                // Run the callback unlocked; it builds the connection and
                // may call back into public connector methods.
                let mut cb = self.inner.lock().connected_cb.take();
                if let Some(f) = cb.as_mut() {
                    f(socket.into_owned());
                }
                if let Some(f) = cb {
                    let mut inner = self.inner.lock();
                    if inner.connected_cb.is_none() {
                        inner.connected_cb = Some(f);
                    }
                }
            } else {
                drop(socket);
            }
        }
    }

    fn handle_error(&self) {
        error!(state = ?self.state(), "connector error");
        if self.state() == State::Connecting {
            if let Some(socket) = self.remove_and_reset_channel() {
                let err = sockets::get_socket_error(socket.fd());
                warn!("SO_ERROR = {err}");
                self.retry(socket);
            }
        }
    }
}
