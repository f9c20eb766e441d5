//! Listening-socket endpoint of a TCP server.

use std::io;
use std::os::unix::io::{OwnedFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::addr::InetAddr;
use crate::channel::{Channel, EventHandler};
use crate::event_loop::LoopHandle;
use crate::sockets::{self, Socket};

/// Receives each accepted descriptor with its peer address. Ownership of
/// the descriptor transfers to the callback.
pub type NewConnectionCallback = Box<dyn FnMut(OwnedFd, InetAddr) + Send>;

struct AcceptorInner {
    new_connection_cb: Option<NewConnectionCallback>,
    // Reserve descriptor released to accept-and-close when the process
    // hits EMFILE; otherwise a level-triggered poller spins on the
    // unaccepted connection.
    idle_fd: Option<OwnedFd>,
    listening: bool,
}

/// Accepts connections on the base loop and hands the descriptors off.
pub struct Acceptor {
    loop_: LoopHandle,
    // Option so teardown can move the socket into a task posted to the
    // loop thread; present for the acceptor's whole usable life.
    socket: Option<Socket>,
    channel: Arc<Channel>,
    inner: Mutex<AcceptorInner>,
}

impl Acceptor {
    /// Create a bound (not yet listening) acceptor.
    ///
    /// # Panics
    ///
    /// Panics when the listening socket cannot be created or bound; a
    /// server that cannot take its address has nothing to fall back to.
    pub fn new(loop_: LoopHandle, listen_addr: &InetAddr, reuse_port: bool) -> Arc<Acceptor> {
        let socket = Socket::new_nonblocking(listen_addr.is_ipv6())
            .expect("failed to create listening socket");
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        socket
            .bind(listen_addr)
            .unwrap_or_else(|e| panic!("failed to bind {listen_addr}: {e}"));

        let channel = Channel::new(loop_.clone(), socket.fd());
        Arc::new_cyclic(|self_weak: &Weak<Acceptor>| {
            let weak: Weak<dyn EventHandler> = self_weak.clone();
            channel.set_handler(weak);
            Acceptor {
                loop_,
                socket: Some(socket),
                channel,
                inner: Mutex::new(AcceptorInner {
                    new_connection_cb: None,
                    idle_fd: open_idle_fd(),
                    listening: false,
                }),
            }
        })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        self.inner.lock().new_connection_cb = Some(cb);
    }

    fn socket(&self) -> &Socket {
        self.socket.as_ref().expect("acceptor socket taken")
    }

    /// Start listening and watching for readability. Loop thread only.
    pub fn listen(&self) {
        self.loop_.assert_in_loop_thread();
        self.inner.lock().listening = true;
        self.socket().listen().expect("listen failed");
        self.channel.enable_reading();
    }

    pub fn listening(&self) -> bool {
        self.inner.lock().listening
    }

    /// The bound address (with the OS-assigned port when bound to port 0).
    pub fn local_addr(&self) -> InetAddr {
        self.socket().local_addr()
    }

    fn listen_fd(&self) -> RawFd {
        self.socket().fd()
    }
}

impl Drop for Acceptor {
    // May run on any thread; channel operations must happen on the loop
    // thread, and the descriptor must stay open until the channel has
    // left the poller.
    fn drop(&mut self) {
        let channel = self.channel.clone();
        let socket = self.socket.take();
        let teardown = move || {
            channel.disable_all();
            channel.remove();
            drop(socket);
        };
        if self.loop_.is_in_loop_thread() {
            teardown();
        } else {
            self.loop_.queue_in_loop(teardown);
        }
    }
}

impl EventHandler for Acceptor {
    fn handle_read(&self, _receive_time: Instant) {
        self.loop_.assert_in_loop_thread();
        match self.socket().accept() {
            Ok((fd, peer_addr)) => {
                let mut inner = self.inner.lock();
                match inner.new_connection_cb.as_mut() {
                    Some(cb) => cb(fd, peer_addr),
                    None => drop(fd),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("accept failed: {e}");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    self.drain_one_with_idle_fd();
                }
            }
        }
    }
}

impl Acceptor {
    // Out of descriptors: free the reserve, accept the pending connection
    // just to close it, then re-open the reserve.
    fn drain_one_with_idle_fd(&self) {
        let mut inner = self.inner.lock();
        if inner.idle_fd.take().is_none() {
            warn!("EMFILE with no idle fd in reserve");
            return;
        }
        let fd = unsafe {
            libc::accept(
                self.listen_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        inner.idle_fd = open_idle_fd();
    }
}

fn open_idle_fd() -> Option<OwnedFd> {
    let fd = unsafe {
        libc::open(
            c"/dev/null".as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        warn!(
            "failed to open /dev/null for the idle reserve: {}",
            io::Error::last_os_error()
        );
        None
    } else {
        Some(sockets::owned_from_raw(fd))
    }
}
