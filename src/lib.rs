//! shoal - multi-reactor TCP networking for Unix-like systems.
//!
//! One reactor per thread: each [`EventLoop`] owns an epoll (or poll)
//! instance, a timer queue, and the channels registered with it, and is
//! only ever touched from its own thread. Cross-thread work goes through
//! a [`LoopHandle`], which posts closures and kicks the loop out of its
//! poll via an eventfd.
//!
//! On top of the dispatcher sit non-blocking TCP servers and clients:
//! accepted connections are distributed round-robin across a pool of
//! worker loops, writes queue with high-water-mark backpressure, and the
//! shutdown handshake is fully asynchronous.
//!
//! # Quick start
//!
//! An echo server:
//!
//! ```no_run
//! use shoal::{EventLoop, InetAddr, ReusePort, TcpServer};
//!
//! let event_loop = EventLoop::new();
//! let addr = InetAddr::new(7000, false, false);
//! let server = TcpServer::new(event_loop.handle(), &addr, "echo", ReusePort::Disabled);
//! server.set_message_callback(std::sync::Arc::new(|conn, buf, _at| {
//!     let payload = buf.take();
//!     conn.send(&payload);
//! }));
//! server.set_thread_num(4);
//! server.start();
//! event_loop.run();
//! ```
//!
//! A client:
//!
//! ```no_run
//! use shoal::{EventLoop, InetAddr, TcpClient};
//!
//! let event_loop = EventLoop::new();
//! let addr: InetAddr = "127.0.0.1:7000".parse().unwrap();
//! let client = TcpClient::new(event_loop.handle(), addr, "echo-client");
//! client.enable_retry();
//! client.set_connection_callback(std::sync::Arc::new(|conn| {
//!     if conn.is_connected() {
//!         conn.send(b"hello\n");
//!     }
//! }));
//! client.connect();
//! event_loop.run();
//! ```
//!
//! # Threading model
//!
//! Callbacks on a given connection (connection, message, write-complete,
//! high-water-mark) are serialized on that connection's loop and must not
//! block; a blocking callback stalls every connection on the same
//! reactor. [`TcpConnection::send`] is safe from any thread.
//!
//! # Backend selection
//!
//! The default poller is epoll. Setting the `SHOAL_USE_POLL` environment
//! variable (to any value) selects the portable `poll(2)` backend
//! instead.

mod acceptor;
mod addr;
mod buffer;
mod channel;
mod connector;
mod error;
mod event_loop;
mod event_loop_thread;
mod poller;
mod sockets;
mod tcp_client;
mod tcp_connection;
mod tcp_server;
mod thread_pool;
mod timer;
mod timer_queue;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use addr::InetAddr;
pub use buffer::{Buffer, CHEAP_PREPEND, INITIAL_SIZE};
pub use channel::{Channel, EventHandler};
pub use connector::{ConnectedCallback, Connector};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use event_loop_thread::{EventLoopThread, ThreadInitCallback};
pub use sockets::Socket;
pub use tcp_client::TcpClient;
pub use tcp_connection::{
    ConnectionCallback, DEFAULT_HIGH_WATER_MARK, HighWaterMarkCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback, default_connection_callback, default_message_callback,
};
pub use tcp_server::{ReusePort, TcpServer};
pub use thread_pool::EventLoopThreadPool;
pub use timer::TimerId;
