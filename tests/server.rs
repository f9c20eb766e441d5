//! TcpServer behavior: worker assignment, backpressure, half-close.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shoal::{EventLoopThread, ReusePort, TcpConnection, TcpServer};

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

#[test]
fn connections_are_assigned_round_robin() {
    init_logs();
    let mut base = EventLoopThread::new("rr-base", None);
    let base_handle = base.start_loop();

    let addr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(base_handle.clone(), &addr, "rr", ReusePort::Disabled);
    server.set_thread_num(4);

    let owners: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let record = owners.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.is_connected() {
            record.lock().push(std::thread::current().id());
        }
    }));

    let starter = server.clone();
    base_handle.run_in_loop(move || starter.start());
    let port = server.listen_addr().port();

    // Serial connects so accept order matches connect order.
    let mut streams = Vec::new();
    for i in 0..8 {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_until(Duration::from_secs(2), || owners.lock().len() == i + 1));
        streams.push(stream);
    }

    let owners = owners.lock().clone();
    assert_eq!(owners.len(), 8);
    // First four hit distinct workers, then the cycle repeats.
    for i in 0..4 {
        assert_eq!(owners[i], owners[i + 4], "slot {i} should repeat");
        for j in (i + 1)..4 {
            assert_ne!(owners[i], owners[j], "slots {i} and {j} should differ");
        }
    }
}

#[test]
fn start_is_idempotent() {
    init_logs();
    let mut base = EventLoopThread::new("idem-base", None);
    let base_handle = base.start_loop();

    let addr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(base_handle.clone(), &addr, "idem", ReusePort::Disabled);
    server.set_thread_num(1);

    let starter = server.clone();
    base_handle.run_in_loop(move || {
        starter.start();
        starter.start();
        starter.start();
    });

    let port = server.listen_addr().port();
    let stream = TcpStream::connect(("127.0.0.1", port));
    assert!(stream.is_ok());
}

#[test]
fn high_water_mark_fires_once_on_crossing() {
    init_logs();
    let mut base = EventLoopThread::new("hwm-base", None);
    let base_handle = base.start_loop();

    let addr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(base_handle.clone(), &addr, "hwm", ReusePort::Disabled);
    server.set_thread_num(1);

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hwm_arg = Arc::new(AtomicUsize::new(0));
    let conn_slot: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));

    let slot = conn_slot.clone();
    let (hits, arg) = (hwm_hits.clone(), hwm_arg.clone());
    server.set_connection_callback(Arc::new(move |conn| {
        if conn.is_connected() {
            conn.set_high_water_mark(1024);
            let hits = hits.clone();
            let arg = arg.clone();
            conn.set_high_water_mark_callback(Arc::new(move |_conn, queued| {
                hits.fetch_add(1, Ordering::SeqCst);
                arg.store(queued, Ordering::SeqCst);
            }));
            *slot.lock() = Some(conn.clone());
        }
    }));

    let starter = server.clone();
    base_handle.run_in_loop(move || starter.start());
    let port = server.listen_addr().port();

    // Peer that never reads: the kernel buffer fills and the rest queues.
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(wait_until(Duration::from_secs(2), || conn_slot.lock().is_some()));
    let conn = conn_slot.lock().clone().unwrap();

    // Large enough that kernel send/receive buffers cannot absorb it all.
    let payload = vec![b'x'; 32 * 1024 * 1024];
    conn.send(&payload);
    assert!(wait_until(Duration::from_secs(2), || {
        hwm_hits.load(Ordering::SeqCst) == 1
    }));
    assert!(hwm_arg.load(Ordering::SeqCst) >= 1024);

    // Still above the mark: more sends must not re-fire the callback.
    conn.send(&vec![b'y'; 2048]);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hwm_hits.load(Ordering::SeqCst), 1);
    assert!(conn.queued_output() > 0);

    drop(stream);
}

#[test]
fn shutdown_half_closes_and_drops_later_sends() {
    init_logs();
    let mut base = EventLoopThread::new("hc-base", None);
    let base_handle = base.start_loop();

    let addr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(base_handle.clone(), &addr, "hc", ReusePort::Disabled);
    server.set_thread_num(1);

    let downs = Arc::new(AtomicUsize::new(0));
    let d = downs.clone();
    server.set_connection_callback(Arc::new(move |conn| {
        if !conn.is_connected() {
            d.fetch_add(1, Ordering::SeqCst);
        }
    }));
    // On "quit": answer, then shut down the write side, then try a late
    // send which must be silently dropped.
    server.set_message_callback(Arc::new(|conn, buf, _at| {
        let request = buf.take();
        if request == b"quit" {
            conn.send(b"bye");
            conn.shutdown();
            conn.shutdown();
            conn.send(b"after-fin");
        }
    }));

    let starter = server.clone();
    base_handle.run_in_loop(move || starter.start());
    let port = server.listen_addr().port();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.write_all(b"quit").unwrap();

    let mut reply = [0u8; 3];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"bye");

    // FIN, with nothing after it.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    // Our write side is still open (half-close); the connection only
    // finishes when we close.
    assert_eq!(downs.load(Ordering::SeqCst), 0);
    drop(stream);
    assert!(wait_until(Duration::from_secs(2), || {
        downs.load(Ordering::SeqCst) == 1
    }));
}
