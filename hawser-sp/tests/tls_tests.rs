//! TLS adapter tests with a passthrough engine.
//!
//! The adapter is engine-agnostic; these tests exercise the record
//! buffering, queueing, and lifecycle with an engine that moves plaintext
//! through unchanged.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hawser_core::aio::{Aio, Timeout};
use hawser_core::error::{Error, Result};
use hawser_core::platform::{TcpDialer, TcpListener};
use hawser_core::stream::{take_stream_output, Stream, StreamDialer, StreamListener};
use hawser_sp::tls::{
    set_engine, EngineIo, TlsConfig, TlsDialer, TlsEngine, TlsEngineConn, TlsListener, TlsMode,
};

struct Passthrough;

struct PassthroughConn;

impl TlsEngineConn for PassthroughConn {
    fn handshake(&mut self, _io: &mut dyn EngineIo) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, buf: &[u8], io: &mut dyn EngineIo) -> Result<usize> {
        io.put_ciphertext(buf)
    }

    fn recv(&mut self, buf: &mut [u8], io: &mut dyn EngineIo) -> Result<usize> {
        io.get_ciphertext(buf)
    }

    fn verified(&self) -> bool {
        false
    }

    fn peer_cn(&self) -> Option<String> {
        None
    }
}

impl TlsEngine for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn new_conn(&self, _cfg: &TlsConfig) -> Result<Box<dyn TlsEngineConn>> {
        Ok(Box::new(PassthroughConn))
    }
}

fn ensure_engine() {
    // First caller installs it; racing tests see Busy, which is fine.
    let _ = set_engine(Arc::new(Passthrough));
}

fn loopback() -> SocketAddr {
    let port = portpicker::pick_unused_port().expect("no free port");
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn tls_pair() -> (Box<dyn Stream>, Box<dyn Stream>, Arc<TlsConfig>) {
    ensure_engine();
    let addr = loopback();

    let server_cfg = Arc::new(TlsConfig::new(TlsMode::Server));
    let listener = TlsListener::new(Box::new(TcpListener::new(addr)), server_cfg);
    listener.listen().unwrap();

    let accept_aio = Aio::new(|_| {});
    listener.accept(&accept_aio);

    let client_cfg = Arc::new(TlsConfig::new(TlsMode::Client));
    client_cfg.set_server_name("localhost").unwrap();
    let dialer = TlsDialer::new(Box::new(TcpDialer::new(addr)), client_cfg.clone());
    let dial_aio = Aio::new(|_| {});
    dialer.dial(&dial_aio);

    dial_aio.wait();
    accept_aio.wait();
    dial_aio.result().unwrap();
    accept_aio.result().unwrap();

    let client = take_stream_output(&dial_aio).unwrap();
    let server = take_stream_output(&accept_aio).unwrap();
    (client, server, client_cfg)
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
fn roundtrip_through_engine() {
    let (client, server, _) = tls_pair();

    send_all(client.as_ref(), b"over the record layer");
    assert_eq!(&recv_exact(server.as_ref(), 21), b"over the record layer");

    send_all(server.as_ref(), b"and back");
    assert_eq!(&recv_exact(client.as_ref(), 8), b"and back");

    client.close();
    server.close();
}

#[test]
fn large_transfer_exceeds_ring_capacity() {
    let (client, server, _) = tls_pair();

    // Several times the 16 KiB ring, so backpressure must engage.
    let data: Vec<u8> = (0..100_000usize).map(|i| (i % 251) as u8).collect();
    let tx = data.clone();
    let client2 = client;
    let sender = std::thread::spawn(move || {
        send_all(client2.as_ref(), &tx);
        client2
    });
    let got = recv_exact(server.as_ref(), data.len());
    assert_eq!(got, data);

    let client = sender.join().unwrap();
    client.close();
    server.close();
}

#[test]
fn config_freezes_on_use() {
    let (_client, _server, cfg) = tls_pair();
    assert_eq!(cfg.set_server_name("late"), Err(Error::Busy));
}

#[test]
fn close_fails_pending_recv() {
    let (client, _server, _) = tls_pair();

    let aio = Aio::new(|_| {});
    aio.set_recv(1);
    client.recv(&aio);
    client.close();
    aio.wait();
    assert_eq!(aio.result(), Err(Error::Closed));
    client.close();
}

#[test]
fn recv_timeout_tears_down_connection() {
    let (client, _server, _) = tls_pair();

    let aio = Aio::new(|_| {});
    aio.set_timeout(Timeout::After(Duration::from_millis(50)));
    aio.set_recv(1);
    client.recv(&aio);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::TimedOut));
}

#[test]
fn dialer_config_swap_refused_after_start() {
    ensure_engine();
    let addr = loopback();
    let dialer = TlsDialer::new(
        Box::new(TcpDialer::new(addr)),
        Arc::new(TlsConfig::new(TlsMode::Client)),
    );
    let aio = Aio::new(|_| {});
    dialer.dial(&aio);
    assert_eq!(
        dialer.set_config(Arc::new(TlsConfig::new(TlsMode::Client))),
        Err(Error::Busy)
    );
    aio.wait();
}
