//! Multi-threaded echo server.
//!
//! ```text
//! cargo run --example echo -- [port] [threads]
//! ```

use std::sync::Arc;

use shoal::{EventLoop, InetAddr, ReusePort, TcpServer};
use tracing::info;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().and_then(|a| a.parse().ok()).unwrap_or(7000);
    let threads: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);

    let event_loop = EventLoop::new();
    let addr = InetAddr::new(port, false, false);
    let server = TcpServer::new(event_loop.handle(), &addr, "echo", ReusePort::Disabled);
    server.set_thread_num(threads);
    server.set_connection_callback(Arc::new(|conn| {
        info!(
            "{} {} -> {}",
            if conn.is_connected() { "up  " } else { "down" },
            conn.peer_addr(),
            conn.local_addr(),
        );
    }));
    server.set_message_callback(Arc::new(|conn, buf, _at| {
        let payload = buf.take();
        conn.send(&payload);
    }));

    info!("echo server on {} with {} threads", server.ip_port(), threads);
    server.start();
    event_loop.run();
}
