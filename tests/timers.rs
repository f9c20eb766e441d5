//! Timer behavior across threads, against a loop running in a worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shoal::EventLoopThread;

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
fn one_shot_fires_near_its_deadline() {
    let mut worker = EventLoopThread::new("timer-loop", None);
    let handle = worker.start_loop();

    let fired_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let slot = fired_at.clone();
    let scheduled = Instant::now();
    handle.run_after(Duration::from_millis(50), move || {
        *slot.lock() = Some(Instant::now());
    });

    assert!(wait_until(Duration::from_secs(2), || fired_at.lock().is_some()));
    let elapsed = fired_at.lock().unwrap() - scheduled;
    assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "fired late: {elapsed:?}");
}

#[test]
fn repeating_timer_never_fires_early() {
    let mut worker = EventLoopThread::new("timer-loop", None);
    let handle = worker.start_loop();

    let interval = Duration::from_millis(20);
    let fires: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let record = fires.clone();
    let scheduled = Instant::now();
    let id = handle.run_every(interval, move || {
        record.lock().push(Instant::now());
    });

    assert!(wait_until(Duration::from_secs(2), || fires.lock().len() >= 5));
    handle.cancel(id);

    let fires = fires.lock().clone();
    for (k, at) in fires.iter().enumerate().take(5) {
        let lower_bound = interval * (k as u32 + 1);
        assert!(
            *at - scheduled >= lower_bound,
            "fire {k} at {:?}, bound {lower_bound:?}",
            *at - scheduled,
        );
    }
}

#[test]
fn cancel_from_another_thread_prevents_firing() {
    let mut worker = EventLoopThread::new("timer-loop", None);
    let handle = worker.start_loop();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let id = handle.run_after(Duration::from_millis(150), move || {
        h.fetch_add(1, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(20));
    handle.cancel(id);

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn cancelling_twice_is_harmless() {
    let mut worker = EventLoopThread::new("timer-loop", None);
    let handle = worker.start_loop();

    let id = handle.run_after(Duration::from_millis(30), || {});
    handle.cancel(id);
    handle.cancel(id);

    // A cancelled one-shot must not block later timers.
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    handle.run_after(Duration::from_millis(30), move || {
        r.fetch_add(1, Ordering::SeqCst);
    });
    assert!(wait_until(Duration::from_secs(2), || {
        ran.load(Ordering::SeqCst) == 1
    }));
}

#[test]
fn many_timers_fire_in_order() {
    let mut worker = EventLoopThread::new("timer-loop", None);
    let handle = worker.start_loop();

    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    // Schedule out of order; expiration order must win.
    for (label, delay_ms) in [(3u32, 60u64), (1, 20), (4, 80), (2, 40)] {
        let record = order.clone();
        handle.run_after(Duration::from_millis(delay_ms), move || {
            record.lock().push(label);
        });
    }

    assert!(wait_until(Duration::from_secs(2), || order.lock().len() == 4));
    assert_eq!(*order.lock(), vec![1, 2, 3, 4]);
}
