//! TCP and IPC platform stream tests over loopback.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use hawser_core::aio::{Aio, Timeout};
use hawser_core::error::Error;
use hawser_core::platform::{TcpDialer, TcpListener};
use hawser_core::stream::{props, take_stream_output, Stream, StreamDialer, StreamListener};

fn loopback() -> SocketAddr {
    let port = portpicker::pick_unused_port().expect("no free port");
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn tcp_pair() -> (Box<dyn Stream>, Box<dyn Stream>) {
    let addr = loopback();
    let listener = TcpListener::new(addr);
    listener.listen().unwrap();

    let accept_aio = Aio::new(|_| {});
    listener.accept(&accept_aio);

    let dialer = TcpDialer::new(addr);
    let dial_aio = Aio::new(|_| {});
    dialer.dial(&dial_aio);

    dial_aio.wait();
    accept_aio.wait();
    dial_aio.result().unwrap();
    accept_aio.result().unwrap();

    let client = take_stream_output(&dial_aio).unwrap();
    let server = take_stream_output(&accept_aio).unwrap();
    (client, server)
}

fn send_all(stream: &dyn Stream, data: &[u8]) {
    let aio = Aio::new(|_| {});
    aio.set_iov(&[Bytes::copy_from_slice(data)]).unwrap();
    while aio.iov_count() > 0 {
        stream.send(&aio);
        aio.wait();
        aio.result().unwrap();
        aio.iov_advance(aio.count());
    }
}

fn recv_exact(stream: &dyn Stream, len: usize) -> Vec<u8> {
    let aio = Aio::new(|_| {});
    aio.set_recv(len);
    while aio.recv_remaining() > 0 {
        stream.recv(&aio);
        aio.wait();
        aio.result().unwrap();
    }
    aio.take_recv().unwrap().to_vec()
}

#[test]
fn tcp_roundtrip() {
    let (client, server) = tcp_pair();

    send_all(client.as_ref(), b"hello across the wire");
    let got = recv_exact(server.as_ref(), 21);
    assert_eq!(&got, b"hello across the wire");

    // And the other direction.
    send_all(server.as_ref(), b"pong");
    let got = recv_exact(client.as_ref(), 4);
    assert_eq!(&got, b"pong");
}

#[test]
fn tcp_recv_timeout() {
    let (client, _server) = tcp_pair();

    let aio = Aio::new(|_| {});
    aio.set_timeout(Timeout::After(Duration::from_millis(50)));
    aio.set_recv(1);
    client.recv(&aio);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::TimedOut));
}

#[test]
fn tcp_close_fails_pending_recv() {
    let (client, _server) = tcp_pair();

    let aio = Aio::new(|_| {});
    aio.set_recv(1);
    client.recv(&aio);
    client.close();
    aio.wait();
    assert_eq!(aio.result(), Err(Error::Closed));

    // Idempotent.
    client.close();
    client.close();
}

#[test]
fn tcp_peer_close_reports_connshut() {
    let (client, server) = tcp_pair();

    let aio = Aio::new(|_| {});
    aio.set_recv(1);
    client.recv(&aio);
    server.close();
    aio.wait();
    assert_eq!(aio.result(), Err(Error::ConnShut));
}

#[test]
fn tcp_abort_pending_recv_keeps_stream_usable() {
    let (client, server) = tcp_pair();

    let aio = Aio::new(|_| {});
    aio.set_recv(4);
    client.recv(&aio);
    aio.abort(Error::Canceled);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::Canceled));

    // Data sent afterwards still arrives intact on a fresh receive.
    send_all(server.as_ref(), b"late");
    let got = recv_exact(client.as_ref(), 4);
    assert_eq!(&got, b"late");
}

#[test]
fn tcp_bound_port_property() {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = TcpListener::new(addr);
    listener.listen().unwrap();
    let port = listener.get(props::TCP_BOUND_PORT).unwrap().as_int().unwrap();
    assert!(port > 0);
    listener.close();
}

#[test]
fn tcp_listener_close_fails_pending_accept() {
    let addr = loopback();
    let listener = TcpListener::new(addr);
    listener.listen().unwrap();

    let aio = Aio::new(|_| {});
    listener.accept(&aio);
    listener.close();
    aio.wait();
    assert_eq!(aio.result(), Err(Error::Closed));
}

#[test]
fn tcp_dial_refused() {
    let addr = loopback();
    let dialer = TcpDialer::new(addr);
    let aio = Aio::new(|_| {});
    dialer.dial(&aio);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::ConnRefused));
}

#[cfg(unix)]
mod ipc {
    use super::*;
    use hawser_core::platform::{IpcDialer, IpcListener};

    #[test]
    fn ipc_roundtrip() {
        let path = std::env::temp_dir().join(format!("hawser-test-{}.sock", std::process::id()));
        let listener = IpcListener::new(path.clone());
        listener.listen().unwrap();

        let accept_aio = Aio::new(|_| {});
        listener.accept(&accept_aio);

        let dialer = IpcDialer::new(path.clone());
        let dial_aio = Aio::new(|_| {});
        dialer.dial(&dial_aio);

        dial_aio.wait();
        accept_aio.wait();
        dial_aio.result().unwrap();
        accept_aio.result().unwrap();

        let client = take_stream_output(&dial_aio).unwrap();
        let server = take_stream_output(&accept_aio).unwrap();

        send_all(client.as_ref(), b"over the socket file");
        let got = recv_exact(server.as_ref(), 20);
        assert_eq!(&got, b"over the socket file");

        listener.close();
        assert!(!path.exists());
    }
}
