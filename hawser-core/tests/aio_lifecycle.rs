//! End-to-end AIO lifecycle tests: timeouts, aborts, stop, re-use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hawser_core::aio::{sleep_aio, Aio, Timeout};
use hawser_core::error::Error;

#[test]
fn timeout_preempts_long_sleep() {
    let aio = Aio::new(|_| {});
    aio.set_timeout(Timeout::After(Duration::from_millis(100)));

    let start = Instant::now();
    sleep_aio(Duration::from_secs(10), &aio);
    aio.wait();

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(aio.result(), Err(Error::TimedOut));
    assert_eq!(aio.count(), 0);
}

#[test]
fn abort_completes_queued_operation() {
    let aio = Aio::new(|_| {});
    sleep_aio(Duration::from_secs(30), &aio);
    aio.abort(Error::Canceled);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::Canceled));
}

#[test]
fn stop_then_submit_reports_stopped() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let aio = Aio::new(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    aio.stop();
    sleep_aio(Duration::from_millis(1), &aio);
    aio.wait();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(aio.result(), Err(Error::Stopped));
}

#[test]
fn callback_fires_exactly_once_per_start() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let aio = Aio::new(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    for i in 1..=5 {
        sleep_aio(Duration::from_millis(5), &aio);
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), i);
        assert_eq!(aio.result(), Ok(()));
    }
}

#[test]
fn abort_racing_expiration_completes_once() {
    // Abort just as the deadline passes; whichever side takes the cancel
    // hook first wins, and the callback still runs exactly once.
    for _ in 0..50 {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let aio = Aio::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        sleep_aio(Duration::from_millis(2), &aio);
        std::thread::sleep(Duration::from_millis(2));
        aio.abort(Error::Canceled);
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let res = aio.result();
        assert!(
            res == Ok(()) || res == Err(Error::Canceled),
            "unexpected result {res:?}"
        );
    }
}

#[test]
fn absolute_expiration_in_past_fails_immediately() {
    let aio = Aio::new(|_| {});
    aio.set_expire(Instant::now() - Duration::from_millis(1));
    aio.reset();
    assert!(!aio.start(|a, code| a.finish_error(code)));
    aio.wait();
    assert_eq!(aio.result(), Err(Error::TimedOut));
}

#[test]
fn absolute_expiration_fires() {
    let aio = Aio::new(|_| {});
    aio.set_expire(Instant::now() + Duration::from_millis(50));
    aio.reset();

    let start = Instant::now();
    // A provider that never finishes on its own; expiration must unwind
    // it through the cancel hook.
    assert!(aio.start(|a, code| a.finish_error(code)));
    aio.wait();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(aio.result(), Err(Error::TimedOut));
}

#[test]
fn resubmit_from_callback() {
    // A callback may start the next operation on its own aio.
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let aio = Aio::new(move |a| {
        if h.fetch_add(1, Ordering::SeqCst) == 0 {
            sleep_aio(Duration::from_millis(5), a);
        }
    });
    sleep_aio(Duration::from_millis(5), &aio);

    let deadline = Instant::now() + Duration::from_secs(5);
    while hits.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
