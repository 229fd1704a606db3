//! End-to-end scenarios exercising the AIO, socket, and transport layers
//! together.

use std::time::{Duration, Instant};

use hawser::{bus, sleep_aio, Aio, Error, Msg, Timeout};

#[test]
fn timeout_fires_on_long_sleep() {
    let aio = Aio::new(|_| {});
    aio.set_timeout(Timeout::After(Duration::from_millis(100)));

    let start = Instant::now();
    sleep_aio(Duration::from_secs(10), &aio);
    aio.wait();

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(aio.result(), Err(Error::TimedOut));
    assert_eq!(aio.count(), 0);
}

#[test]
fn abort_while_queued_on_peerless_bus() {
    let s = bus::open();

    let aio = Aio::new(|_| {});
    s.recv_aio(&aio);
    assert!(aio.busy());

    aio.abort(Error::Canceled);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::Canceled));

    s.close();
}

#[test]
fn stopped_aio_refuses_socket_recv() {
    let s = bus::open();

    let aio = Aio::new(|_| {});
    aio.stop();
    s.recv_aio(&aio);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::Stopped));

    s.close();
}

#[test]
fn oversize_message_drops_the_pipe() {
    let port = portpicker::pick_unused_port().expect("no free port");
    let addr = format!("tcp://127.0.0.1:{port}");

    let receiver = bus::open();
    receiver.set_recvmax(64);
    receiver.listen(&addr).unwrap();

    let sender = bus::open();
    sender.dial(&addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while receiver.pipe_count() < 1 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(5));
    }

    // 128 bytes against a 64-byte limit: the receiving transport fails
    // the pipe with MsgSize and the socket drops it.
    sender.send_msg(Msg::from_bytes(&[0u8; 128])).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while receiver.pipe_count() > 0 {
        assert!(Instant::now() < deadline, "oversize pipe was not dropped");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        receiver.recv_msg_timeout(Duration::from_millis(100)),
        Err(Error::TimedOut)
    );

    receiver.close();
    sender.close();
}

#[test]
fn websocket_dial_against_plain_http_is_refused() {
    // A plain HTTP server that was never going to upgrade.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        use std::io::{Read, Write};
        if let Ok((mut conn, _)) = listener.accept() {
            let mut buf = [0u8; 2048];
            let _ = conn.read(&mut buf);
            let _ = conn.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        }
    });

    let s = bus::open();
    let err = s.dial(&format!("ws://{addr}/bus")).unwrap_err();
    assert_eq!(err, Error::ConnRefused);
    s.close();
}

#[test]
fn recv_completes_exactly_once_under_churn() {
    // Receives racing with aborts never double-complete and never lose a
    // completion.
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let s = bus::open();
    for _ in 0..100 {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let aio = Aio::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        s.recv_aio(&aio);
        aio.abort(Error::Canceled);
        aio.wait();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
    s.close();
}

#[test]
fn socket_close_is_idempotent() {
    let s = bus::open();
    s.close();
    s.close();
    assert_eq!(s.recv_msg(), Err(Error::Closed));
    assert_eq!(s.send_msg(Msg::from_bytes(b"x")), Err(Error::Closed));
}
