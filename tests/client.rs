//! TcpClient behavior: connect, disconnect, reconnect with backoff.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use shoal::{EventLoopThread, InetAddr, ReusePort, TcpClient, TcpServer};

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// A port that was just bound and released: almost certainly still free.
fn grab_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn client_connects_and_echoes() {
    init_logs();
    let mut server_thread = EventLoopThread::new("cli-srv", None);
    let server_handle = server_thread.start_loop();
    let addr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(server_handle.clone(), &addr, "srv", ReusePort::Disabled);
    server.set_message_callback(Arc::new(|conn, buf, _at| {
        let payload = buf.take();
        conn.send(&payload);
    }));
    let starter = server.clone();
    server_handle.run_in_loop(move || starter.start());
    let server_addr = server.listen_addr();

    let mut client_thread = EventLoopThread::new("cli", None);
    let client_handle = client_thread.start_loop();
    let client = TcpClient::new(client_handle.clone(), server_addr, "client");

    let echoes = Arc::new(AtomicUsize::new(0));
    let e = echoes.clone();
    client.set_connection_callback(Arc::new(|conn| {
        if conn.is_connected() {
            conn.send(b"marco");
        }
    }));
    client.set_message_callback(Arc::new(move |conn, buf, _at| {
        if buf.peek() == b"marco" {
            buf.retrieve_all();
            e.fetch_add(1, Ordering::SeqCst);
            conn.shutdown();
        }
    }));
    client.connect();

    assert!(wait_until(Duration::from_secs(2), || {
        echoes.load(Ordering::SeqCst) == 1
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        client.connection().is_none()
    }));
}

#[test]
fn disconnect_half_closes_current_connection() {
    init_logs();
    let mut server_thread = EventLoopThread::new("dc-srv", None);
    let server_handle = server_thread.start_loop();
    let addr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(server_handle.clone(), &addr, "srv", ReusePort::Disabled);
    let starter = server.clone();
    server_handle.run_in_loop(move || starter.start());

    let mut client_thread = EventLoopThread::new("dc-cli", None);
    let client_handle = client_thread.start_loop();
    let client = TcpClient::new(client_handle.clone(), server.listen_addr(), "client");
    client.connect();

    assert!(wait_until(Duration::from_secs(2), || {
        client.connection().is_some()
    }));
    client.disconnect();
    // The server sees our FIN, closes, and our side fully drops.
    assert!(wait_until(Duration::from_secs(2), || {
        client.connection().is_none()
    }));
}

#[test]
fn reconnects_with_backoff_until_server_appears() {
    init_logs();
    let port = grab_free_port();
    let target: InetAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut client_thread = EventLoopThread::new("rc-cli", None);
    let client_handle = client_thread.start_loop();
    let client = TcpClient::new(client_handle.clone(), target, "client");
    client.enable_retry();

    let ups = Arc::new(AtomicUsize::new(0));
    let u = ups.clone();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.is_connected() {
            u.fetch_add(1, Ordering::SeqCst);
        }
    }));
    client.connect();

    // Refused attempts back off at roughly 0.5 s, 1 s, 2 s, ...
    std::thread::sleep(Duration::from_millis(1700));
    assert_eq!(ups.load(Ordering::SeqCst), 0);

    let mut server_thread = EventLoopThread::new("rc-srv", None);
    let server_handle = server_thread.start_loop();
    let addr: InetAddr = format!("127.0.0.1:{port}").parse().unwrap();
    let server = TcpServer::new(server_handle.clone(), &addr, "late-srv", ReusePort::Disabled);
    let starter = server.clone();
    server_handle.run_in_loop(move || starter.start());

    // The next retry (at most 2 s out) lands on the live listener.
    assert!(wait_until(Duration::from_secs(4), || {
        ups.load(Ordering::SeqCst) == 1
    }));
}
