//! Many concurrent echo clients across the worker pool, each verifying
//! its own byte stream.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use shoal::{EventLoopThread, ReusePort, TcpServer};

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

#[test]
fn concurrent_clients_each_get_their_own_bytes_back() {
    let mut base = EventLoopThread::new("stress-base", None);
    let base_handle = base.start_loop();

    let addr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(base_handle.clone(), &addr, "stress", ReusePort::Disabled);
    server.set_thread_num(4);
    server.set_message_callback(Arc::new(|conn, buf, _at| {
        let payload = buf.take();
        conn.send(&payload);
    }));
    let starter = server.clone();
    base_handle.run_in_loop(move || starter.start());
    let port = server.listen_addr().port();

    const CLIENTS: usize = 12;
    const MESSAGES: usize = 50;

    // Clients hold their sockets open until everyone is done, so the
    // registry peak is observable.
    let done = Arc::new(Barrier::new(CLIENTS + 1));

    let mut workers = Vec::new();
    for client_id in 0..CLIENTS {
        let done = done.clone();
        workers.push(std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();

            let mut sent = Vec::new();
            let mut received = Vec::new();
            for i in 0..MESSAGES {
                let msg = format!("client-{client_id}-msg-{i};");
                stream.write_all(msg.as_bytes()).unwrap();
                sent.extend_from_slice(msg.as_bytes());

                // Read whatever has echoed so far; exact framing does not
                // matter, only the byte stream.
                let mut chunk = [0u8; 4096];
                if let Ok(n) = stream.read(&mut chunk) {
                    received.extend_from_slice(&chunk[..n]);
                }
            }
            while received.len() < sent.len() {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "peer closed early");
                received.extend_from_slice(&chunk[..n]);
            }
            assert_eq!(received, sent, "client {client_id} stream corrupted");
            done.wait();
        }));
    }

    // All clients connected and parked at the barrier.
    assert!(wait_until(Duration::from_secs(5), || {
        server.connection_count() == CLIENTS
    }));
    done.wait();

    for worker in workers {
        worker.join().unwrap();
    }

    // All clients dropped: the registry drains.
    assert!(wait_until(Duration::from_secs(5), || {
        server.connection_count() == 0
    }));
}
