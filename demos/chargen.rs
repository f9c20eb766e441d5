//! Chargen-style load generator: streams a rotating character pattern to
//! every client as fast as it will take it, throttled by the write-complete
//! callback so the output buffer never grows without bound.
//!
//! ```text
//! cargo run --example chargen -- [port]
//! ```

use std::sync::Arc;
use std::time::Duration;

use shoal::{Buffer, EventLoop, InetAddr, ReusePort, TcpConnection, TcpServer};
use tracing::info;

fn pattern() -> Vec<u8> {
    // RFC 864 style: 72-character rotating lines over the printable set.
    let printable: Vec<u8> = (33u8..127).collect();
    let mut out = Vec::new();
    for shift in 0..printable.len() {
        for i in 0..72 {
            out.push(printable[(shift + i) % printable.len()]);
        }
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn refill(conn: &Arc<TcpConnection>) {
    let mut buf = Buffer::with_capacity(0);
    buf.append(&pattern());
    conn.send_buffer(&mut buf);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(7001);

    let event_loop = EventLoop::new();
    let addr = InetAddr::new(port, false, false);
    let server = TcpServer::new(event_loop.handle(), &addr, "chargen", ReusePort::Disabled);
    server.set_connection_callback(Arc::new(|conn| {
        if conn.is_connected() {
            conn.set_tcp_no_delay(true);
            refill(conn);
        }
    }));
    server.set_write_complete_callback(Arc::new(refill));

    let probe = server.clone();
    event_loop
        .handle()
        .run_every(Duration::from_secs(3), move || {
            info!("chargen serving on {}", probe.ip_port());
        });

    info!("chargen server on {}", server.ip_port());
    server.start();
    event_loop.run();
}
