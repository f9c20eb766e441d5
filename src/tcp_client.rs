//! TCP client: one connector, at most one live connection.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::addr::InetAddr;
use crate::connector::Connector;
use crate::event_loop::LoopHandle;
use crate::sockets;
use crate::tcp_connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};

struct ClientInner {
    connection: Option<Arc<TcpConnection>>,
    connection_cb: ConnectionCallback,
    message_cb: MessageCallback,
    write_complete_cb: Option<WriteCompleteCallback>,
}

/// Connects to one endpoint, optionally reconnecting with exponential
/// backoff when the connection goes down.
///
/// The connection slot is mutex-protected: user code may call
/// [`connection`](Self::connection) from any thread.
pub struct TcpClient {
    loop_: LoopHandle,
    connector: Arc<Connector>,
    name: String,
    connect_flag: AtomicBool,
    retry_flag: AtomicBool,
    next_conn_id: AtomicU64,
    inner: Mutex<ClientInner>,
    self_weak: Weak<TcpClient>,
}

impl TcpClient {
    pub fn new(
        loop_: LoopHandle,
        server_addr: InetAddr,
        name: impl Into<String>,
    ) -> Arc<TcpClient> {
        let name = name.into();
        let connector = Connector::new(loop_.clone(), server_addr);
        debug!(name = %name, addr = %server_addr, "TcpClient created");
        Arc::new_cyclic(|self_weak: &Weak<TcpClient>| {
            let weak = self_weak.clone();
            connector.set_connected_callback(Box::new(move |fd| {
                if let Some(client) = weak.upgrade() {
                    client.new_connection(fd);
                }
            }));
            TcpClient {
                loop_,
                connector,
                name,
                connect_flag: AtomicBool::new(false),
                retry_flag: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(0),
                inner: Mutex::new(ClientInner {
                    connection: None,
                    connection_cb: Arc::new(crate::tcp_connection::default_connection_callback),
                    message_cb: Arc::new(crate::tcp_connection::default_message_callback),
                    write_complete_cb: None,
                }),
                self_weak: self_weak.clone(),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server_addr(&self) -> InetAddr {
        self.connector.server_addr()
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    /// The live connection, if established.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.inner.lock().connection.clone()
    }

    /// Reconnect automatically (with backoff reset) after a close.
    pub fn enable_retry(&self) {
        self.retry_flag.store(true, Ordering::Release);
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry_flag.load(Ordering::Acquire)
    }

    /// Start connecting.
    pub fn connect(&self) {
        info!(name = %self.name, addr = %self.server_addr(), "connecting");
        self.connect_flag.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Half-close the live connection, if any.
    pub fn disconnect(&self) {
        self.connect_flag.store(false, Ordering::Release);
        if let Some(conn) = self.inner.lock().connection.clone() {
            conn.shutdown();
        }
    }

    /// Abandon the connect attempt and any pending retry.
    pub fn stop(&self) {
        self.connect_flag.store(false, Ordering::Release);
        self.connector.stop();
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

    fn new_connection(&self, sock_fd: OwnedFd) {
        self.loop_.assert_in_loop_thread();
        let raw = sock_fd.as_raw_fd();
        let peer_addr = sockets::peer_addr(raw);
        let local_addr = sockets::local_addr(raw);
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_name = format!("{}:{}#{}", self.name, peer_addr.to_ip_port(), id);

        let conn = TcpConnection::new(
            self.loop_.clone(),
            conn_name,
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
            inner.connection = Some(conn.clone());
        }
        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |c| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(c);
            }
        }));
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        self.loop_.assert_in_loop_thread();
        {
            let mut inner = self.inner.lock();
            debug_assert!(
                inner
                    .connection
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(c, conn))
            );
            inner.connection = None;
        }
        let destroyed = conn.clone();
        self.loop_.queue_in_loop(move || destroyed.connect_destroyed());

        if self.retry_flag.load(Ordering::Acquire) && self.connect_flag.load(Ordering::Acquire) {
            info!(name = %self.name, addr = %self.server_addr(), "reconnecting");
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        debug!(name = %self.name, "TcpClient destructs");
        let conn = self.inner.lock().connection.take();
        match conn {
            Some(conn) => {
                // The application may still hold the connection; leave
                // only a destroy-on-close hook behind.
                let lp = self.loop_.clone();
                conn.set_close_callback(Arc::new(move |c| {
                    let destroyed = c.clone();
                    lp.queue_in_loop(move || destroyed.connect_destroyed());
                }));
                // `conn` plus nothing else: safe to force the teardown.
                if Arc::strong_count(&conn) == 1 {
                    conn.force_close();
                }
            }
            None => {
                self.connector.stop();
                // Keep the connector alive briefly so an in-flight retry
                // timer can unwind against a live object.
                let mut parked = Some(self.connector.clone());
                self.loop_.run_after(Duration::from_secs(1), move || {
                    parked.take();
                });
            }
        }
    }
}
