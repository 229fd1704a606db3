//! BUS pattern tests over the real transports.

use std::time::{Duration, Instant};

use hawser::{bus, Error, Msg, Socket, Timeout};

fn loopback_tcp() -> String {
    let port = portpicker::pick_unused_port().expect("no free port");
    format!("tcp://127.0.0.1:{port}")
}

fn wait_pipes(sock: &Socket, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while sock.pipe_count() < n {
        assert!(Instant::now() < deadline, "timed out waiting for pipes");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn marry(listener: &Socket, dialer: &Socket, addr: &str) {
    let before = listener.pipe_count();
    dialer.dial(addr).unwrap();
    wait_pipes(listener, before + 1);
}

#[test]
fn star_fanout() {
    let s1 = bus::open();
    let s2 = bus::open();
    let s3 = bus::open();
    for s in [&s1, &s2, &s3] {
        s.set_recv_timeout(Timeout::After(Duration::from_secs(1)));
    }

    let addr = loopback_tcp();
    s1.listen(&addr).unwrap();
    marry(&s1, &s2, &addr);
    marry(&s1, &s3, &addr);

    s1.send_msg(Msg::from_bytes(b"one")).unwrap();
    assert_eq!(s2.recv_msg().unwrap().body(), b"one");
    assert_eq!(s3.recv_msg().unwrap().body(), b"one");

    s2.send_msg(Msg::from_bytes(b"two")).unwrap();
    s1.send_msg(Msg::from_bytes(b"one")).unwrap();
    assert_eq!(s1.recv_msg().unwrap().body(), b"two");
    assert_eq!(s2.recv_msg().unwrap().body(), b"one");
    assert_eq!(s3.recv_msg().unwrap().body(), b"one");

    s1.close();
    s2.close();
    s3.close();
}

#[test]
fn no_echo_to_sender() {
    let s1 = bus::open();
    let s2 = bus::open();
    let addr = loopback_tcp();
    s1.listen(&addr).unwrap();
    marry(&s1, &s2, &addr);

    s2.send_msg(Msg::from_bytes(b"only-for-s1")).unwrap();
    assert_eq!(s1.recv_msg_timeout(Duration::from_secs(1)).unwrap().body(), b"only-for-s1");

    // The sender itself hears nothing.
    assert_eq!(
        s2.recv_msg_timeout(Duration::from_millis(100)),
        Err(Error::TimedOut)
    );

    s1.close();
    s2.close();
}

#[test]
fn roundtrip_large_message() {
    let s1 = bus::open();
    let s2 = bus::open();
    let addr = loopback_tcp();
    s1.listen(&addr).unwrap();
    marry(&s1, &s2, &addr);

    let data: Vec<u8> = (0..200_000usize).map(|i| (i % 239) as u8).collect();
    s2.send_msg(Msg::from_bytes(&data)).unwrap();
    let got = s1.recv_msg_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got.body(), &data[..]);

    s1.close();
    s2.close();
}

#[cfg(unix)]
#[test]
fn bus_over_ipc() {
    let path = std::env::temp_dir().join(format!("hawser-bus-{}.sock", std::process::id()));
    let addr = format!("ipc://{}", path.display());

    let s1 = bus::open();
    let s2 = bus::open();
    s1.listen(&addr).unwrap();
    marry(&s1, &s2, &addr);

    s1.send_msg(Msg::from_bytes(b"ipc hop")).unwrap();
    assert_eq!(
        s2.recv_msg_timeout(Duration::from_secs(1)).unwrap().body(),
        b"ipc hop"
    );

    s1.close();
    s2.close();
}

#[test]
fn bus_over_websocket() {
    let port = portpicker::pick_unused_port().expect("no free port");
    let addr = format!("ws://127.0.0.1:{port}/bus");

    let s1 = bus::open();
    let s2 = bus::open();
    s1.listen(&addr).unwrap();
    marry(&s1, &s2, &addr);

    s1.send_msg(Msg::from_bytes(b"framed over frames")).unwrap();
    assert_eq!(
        s2.recv_msg_timeout(Duration::from_secs(1)).unwrap().body(),
        b"framed over frames"
    );

    s1.close();
    s2.close();
}

#[test]
fn pipes_have_unique_nonzero_ids() {
    let s1 = bus::open();
    let s2 = bus::open();
    let s3 = bus::open();
    let addr = loopback_tcp();
    s1.listen(&addr).unwrap();
    marry(&s1, &s2, &addr);
    marry(&s1, &s3, &addr);

    let mut ids = s1.pipe_ids();
    ids.extend(s2.pipe_ids());
    ids.extend(s3.pipe_ids());
    assert_eq!(ids.len(), 4);
    assert!(ids.iter().all(|id| *id != 0));
    let mut dedup = ids.clone();
    dedup.sort_unstable();
    dedup.dedup();
    assert_eq!(dedup.len(), ids.len());

    // Live pipes are findable and carry their negotiated peer.
    for id in &ids {
        let pipe = hawser::Pipe::find(*id).unwrap();
        assert_eq!(pipe.peer(), 0x70);
    }

    s1.close();
    s2.close();
    s3.close();
}

#[test]
fn pipe_stats_count_traffic() {
    let s1 = bus::open();
    let s2 = bus::open();
    let addr = loopback_tcp();
    s1.listen(&addr).unwrap();
    marry(&s1, &s2, &addr);

    s2.send_msg(Msg::from_bytes(b"12345678")).unwrap();
    assert_eq!(
        s1.recv_msg_timeout(Duration::from_secs(1)).unwrap().len(),
        8
    );

    let id = s1.pipe_ids()[0];
    let pipe = hawser::Pipe::find(id).unwrap();
    let (rx_msgs, rx_bytes, _tx_msgs, _tx_bytes) = pipe.stats();
    assert_eq!(rx_msgs, 1);
    assert_eq!(rx_bytes, 8);

    s1.close();
    s2.close();
}

#[test]
fn closed_pipes_leave_the_id_map() {
    let s1 = bus::open();
    let s2 = bus::open();
    let addr = loopback_tcp();
    s1.listen(&addr).unwrap();
    marry(&s1, &s2, &addr);

    let ids = s1.pipe_ids();
    s1.close();
    s2.close();
    hawser_core::reap::reap_drain();

    for id in ids {
        assert!(matches!(hawser::Pipe::find(id), Err(Error::NoEnt)));
    }
}
