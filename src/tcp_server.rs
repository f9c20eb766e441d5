//! TCP server: acceptor on the base loop, connections on a worker pool.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::acceptor::Acceptor;
use crate::addr::InetAddr;
use crate::event_loop::LoopHandle;
use crate::event_loop_thread::ThreadInitCallback;
use crate::sockets;
use crate::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::thread_pool::EventLoopThreadPool;

/// Whether the listening socket sets `SO_REUSEPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReusePort {
    Disabled,
    Enabled,
}

struct ServerInner {
    connections: HashMap<String, Arc<TcpConnection>>,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
    thread_init_cb: Option<ThreadInitCallback>,
}

/// Accepts connections on its base loop and distributes them round-robin
/// across the worker pool. The connection registry lives on the base
/// loop; each connection's I/O happens on its own worker.
pub struct TcpServer {
    loop_: LoopHandle,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    inner: Mutex<ServerInner>,
    self_weak: Weak<TcpServer>,
}

impl TcpServer {
    /// Bind `listen_addr` on `loop_` (the base loop).
    ///
    /// # Panics
    ///
    /// Panics if the listening socket cannot be created or bound.
    pub fn new(
        loop_: LoopHandle,
        listen_addr: &InetAddr,
        name: impl Into<String>,
        reuse_port: ReusePort,
    ) -> Arc<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(loop_.clone(), listen_addr, reuse_port == ReusePort::Enabled);
        // Bound address, so a port-0 bind reports the real port.
        let ip_port = acceptor.local_addr().to_ip_port();
        let pool = EventLoopThreadPool::new(loop_.clone(), format!("{name}-io"));

        Arc::new_cyclic(|self_weak: &Weak<TcpServer>| {
            let weak = self_weak.clone();
            acceptor.set_new_connection_callback(Box::new(move |fd, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(fd, peer_addr);
                }
                // Otherwise the descriptor drops closed here.
            }));
            TcpServer {
                loop_,
                ip_port,
                name,
                acceptor,
                pool: Mutex::new(pool),
                started: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(0),
                inner: Mutex::new(ServerInner {
                    connections: HashMap::new(),
                    connection_cb: Arc::new(crate::tcp_connection::default_connection_callback),
                    message_cb: Arc::new(crate::tcp_connection::default_message_callback),
                    write_complete_cb: None,
                    thread_init_cb: None,
                }),
                self_weak: self_weak.clone(),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `"ip:port"` of the bound listening address.
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The bound listening address.
    pub fn listen_addr(&self) -> InetAddr {
        self.acceptor.local_addr()
    }

    /// The base loop.
    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    /// Number of connections currently in the registry.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Number of worker loops; zero means connections share the base
    /// loop. Set before [`start`](Self::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.lock().set_thread_num(num_threads);
    }

    /// Runs inside each worker loop before it starts polling.
    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.inner.lock().thread_init_cb = Some(cb);
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

    /// Spawn the pool and start listening. Idempotent; must be called on
    /// the base loop's thread.
    pub fn start(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let init = self.inner.lock().thread_init_cb.clone();
            self.pool.lock().start(init);
            let acceptor = self.acceptor.clone();
            self.loop_.run_in_loop(move || acceptor.listen());
        }
    }

    fn new_connection(&self, sock_fd: OwnedFd, peer_addr: InetAddr) {
        self.loop_.assert_in_loop_thread();
        let io_loop = self.pool.lock().get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            server = %self.name,
            conn = %conn_name,
            peer = %peer_addr,
            "new connection"
        );
        let local_addr = sockets::local_addr(sock_fd.as_raw_fd());
        let conn = TcpConnection::new(
            io_loop.clone(),
            conn_name.clone(),
            sock_fd,
            local_addr,
            peer_addr,
        );

        {
            let mut inner = self.inner.lock();
            conn.set_connection_callback(inner.connection_cb.clone());
            conn.set_message_callback(inner.message_cb.clone());
            if let Some(cb) = inner.write_complete_cb.clone() {
                conn.set_write_complete_callback(cb);
            }
            inner.connections.insert(conn_name, conn.clone());
        }
        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |c| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(c);
            }
        }));

        let established = conn.clone();
        io_loop.run_in_loop(move || established.connect_established());
    }

    // Runs on the connection's loop; registry changes hop to the base
    // loop.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let weak = self.self_weak.clone();
        let conn = conn.clone();
        self.loop_.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(&conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        self.loop_.assert_in_loop_thread();
        info!(server = %self.name, conn = %conn.name(), "remove connection");
        let removed = self.inner.lock().connections.remove(conn.name());
        if removed.is_none() {
            // Server teardown already drained the registry.
            debug!(conn = %conn.name(), "connection already removed");
            return;
        }
        let destroyed = conn.clone();
        conn.loop_handle()
            .queue_in_loop(move || destroyed.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!(server = %self.name, "TcpServer destructs");
        let connections = std::mem::take(&mut self.inner.lock().connections);
        for (_, conn) in connections {
            let destroyed = conn.clone();
            conn.loop_handle()
                .run_in_loop(move || destroyed.connect_destroyed());
        }
        // The pool drops after this body: each worker quits only once the
        // destroy tasks queued above have drained.
    }
}
