//! Descriptor-exhaustion recovery: the acceptor must keep accepting once
//! EMFILE clears.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use shoal::{EventLoopThread, ReusePort, TcpServer};

fn used_fds() -> u64 {
    std::fs::read_dir("/proc/self/fd").unwrap().count() as u64
}

#[test]
#[ignore = "lowers RLIMIT_NOFILE for the whole process; run alone"]
fn acceptor_recovers_after_fd_exhaustion() {
    let mut base = EventLoopThread::new("emfile-base", None);
    let base_handle = base.start_loop();

    let addr = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(base_handle.clone(), &addr, "emfile", ReusePort::Disabled);
    server.set_message_callback(Arc::new(|conn, buf, _at| {
        let payload = buf.take();
        conn.send(&payload);
    }));
    let starter = server.clone();
    base_handle.run_in_loop(move || starter.start());
    let port = server.listen_addr().port();

    let mut original: libc::rlimit = unsafe { std::mem::zeroed() };
    unsafe {
        assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut original), 0);
    }

    // Tight limit: a few accepts succeed, then the process runs dry and
    // the idle-reserve dance has to kick in.
    let tight = libc::rlimit {
        rlim_cur: used_fds() + 6,
        rlim_max: original.rlim_max,
    };
    unsafe {
        assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &tight), 0);
    }

    let mut streams = Vec::new();
    for _ in 0..16 {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => streams.push(stream),
            Err(_) => break,
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    // Clear the condition.
    drop(streams);
    unsafe {
        assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &original), 0);
    }
    std::thread::sleep(Duration::from_millis(100));

    // The acceptor must still be serving.
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.write_all(b"still-alive").unwrap();
    let mut reply = [0u8; 11];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"still-alive");
}
