//! WebSocket adapter tests: upgrade exchange, framing, both modes.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::thread;

use bytes::Bytes;
use hawser_core::aio::Aio;
use hawser_core::error::Error;
use hawser_core::platform::{TcpDialer, TcpListener};
use hawser_core::stream::{
    take_stream_output, PropValue, Stream, StreamDialer, StreamListener,
};
use hawser_sp::ws::http::Response;
use hawser_sp::ws::{props, WsDialer, WsListener, WsMode};

fn loopback() -> SocketAddr {
    let port = portpicker::pick_unused_port().expect("no free port");
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn ws_listener(addr: SocketAddr, path: &str, mode: WsMode) -> WsListener {
    WsListener::new(Box::new(TcpListener::new(addr)), path, mode)
}

fn ws_dialer(addr: SocketAddr, path: &str, mode: WsMode) -> WsDialer {
    WsDialer::new(
        Box::new(TcpDialer::new(addr)),
        &addr.to_string(),
        path,
        mode,
    )
}

fn ws_pair(mode: WsMode) -> (Box<dyn Stream>, Box<dyn Stream>) {
    let addr = loopback();
    let listener = ws_listener(addr, "/bus", mode);
    listener.listen().unwrap();

    let accept_aio = Aio::new(|_| {});
    listener.accept(&accept_aio);

    let dialer = ws_dialer(addr, "/bus", mode);
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
fn stream_mode_roundtrip() {
    let (client, server) = ws_pair(WsMode::Stream);

    send_all(client.as_ref(), b"frames hide in the stream");
    assert_eq!(&recv_exact(server.as_ref(), 25), b"frames hide in the stream");

    send_all(server.as_ref(), b"unmasked reply");
    assert_eq!(&recv_exact(client.as_ref(), 14), b"unmasked reply");

    client.close();
    server.close();
}

#[test]
fn message_mode_assembles_whole_messages() {
    let (client, server) = ws_pair(WsMode::Message);

    let aio = Aio::new(|_| {});
    aio.set_iov(&[Bytes::from_static(b"whole message")]).unwrap();
    client.send(&aio);
    aio.wait();
    aio.result().unwrap();

    let raio = Aio::new(|_| {});
    server.recv(&raio);
    raio.wait();
    raio.result().unwrap();
    let msg = raio.take_msg().unwrap();
    assert_eq!(msg.body(), b"whole message");

    client.close();
    server.close();
}

#[test]
fn message_mode_fragments_large_sends() {
    let addr = loopback();
    let listener = ws_listener(addr, "/big", WsMode::Message);
    listener.listen().unwrap();
    let accept_aio = Aio::new(|_| {});
    listener.accept(&accept_aio);

    let dialer = ws_dialer(addr, "/big", WsMode::Message);
    // Force fragmentation with a small frame limit.
    dialer
        .set(props::SENDMAX_FRAME, PropValue::Size(1024))
        .unwrap();
    let dial_aio = Aio::new(|_| {});
    dialer.dial(&dial_aio);
    dial_aio.wait();
    accept_aio.wait();
    dial_aio.result().unwrap();
    accept_aio.result().unwrap();
    let client = take_stream_output(&dial_aio).unwrap();
    let server = take_stream_output(&accept_aio).unwrap();

    let data: Vec<u8> = (0..10_000usize).map(|i| (i % 241) as u8).collect();
    let aio = Aio::new(|_| {});
    aio.set_iov(&[Bytes::from(data.clone())]).unwrap();
    client.send(&aio);
    aio.wait();
    aio.result().unwrap();
    assert_eq!(aio.count(), data.len());

    let raio = Aio::new(|_| {});
    server.recv(&raio);
    raio.wait();
    raio.result().unwrap();
    assert_eq!(raio.take_msg().unwrap().body(), &data[..]);

    client.close();
    server.close();
}

#[test]
fn subprotocol_negotiation_echoes_selection() {
    let addr = loopback();
    let listener = ws_listener(addr, "/chat", WsMode::Stream);
    listener
        .set(props::PROTOCOL, PropValue::Str("chat, superchat".into()))
        .unwrap();
    listener.listen().unwrap();
    let accept_aio = Aio::new(|_| {});
    listener.accept(&accept_aio);

    let dialer = ws_dialer(addr, "/chat", WsMode::Stream);
    dialer
        .set(props::PROTOCOL, PropValue::Str("chat".into()))
        .unwrap();
    let dial_aio = Aio::new(|_| {});
    dialer.dial(&dial_aio);
    dial_aio.wait();
    dial_aio.result().unwrap();
    accept_aio.wait();
    accept_aio.result().unwrap();

    let client = take_stream_output(&dial_aio).unwrap();
    let got = client.get("ws.header:Sec-WebSocket-Protocol").unwrap();
    assert_eq!(got, PropValue::Str("chat".into()));
    client.close();
}

#[test]
fn wrong_path_is_refused() {
    let addr = loopback();
    let listener = ws_listener(addr, "/bus", WsMode::Stream);
    listener.listen().unwrap();

    let dialer = ws_dialer(addr, "/elsewhere", WsMode::Stream);
    let dial_aio = Aio::new(|_| {});
    dialer.dial(&dial_aio);
    dial_aio.wait();
    assert_eq!(dial_aio.result(), Err(Error::ConnRefused));
    listener.close();
}

#[test]
fn listener_hook_can_deny_with_forbidden() {
    let addr = loopback();
    let listener = ws_listener(addr, "/guarded", WsMode::Stream);
    listener
        .set_hook(Box::new(|_req, resp: &mut Response| {
            resp.status = 403;
            resp.reason = "Forbidden".to_string();
        }))
        .unwrap();
    listener.listen().unwrap();

    let dialer = ws_dialer(addr, "/guarded", WsMode::Stream);
    let dial_aio = Aio::new(|_| {});
    dialer.dial(&dial_aio);
    dial_aio.wait();
    assert_eq!(dial_aio.result(), Err(Error::Perm));
    listener.close();
}

/// A one-shot HTTP server answering every request with a canned status.
fn canned_http_server(status_line: &'static str) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((mut conn, _)) = listener.accept() {
            let mut buf = [0u8; 2048];
            let _ = conn.read(&mut buf);
            let _ = conn.write_all(status_line.as_bytes());
            let _ = conn.write_all(b"\r\nContent-Length: 0\r\n\r\n");
        }
    });
    addr
}

fn dial_against(addr: SocketAddr) -> Result<(), Error> {
    let dialer = ws_dialer(addr, "/", WsMode::Stream);
    let aio = Aio::new(|_| {});
    dialer.dial(&aio);
    aio.wait();
    aio.result()
}

#[test]
fn upgrade_status_404_maps_to_connrefused() {
    let addr = canned_http_server("HTTP/1.1 404 Not Found");
    assert_eq!(dial_against(addr), Err(Error::ConnRefused));
}

#[test]
fn upgrade_status_401_maps_to_perm() {
    let addr = canned_http_server("HTTP/1.1 401 Unauthorized");
    assert_eq!(dial_against(addr), Err(Error::Perm));
}

#[test]
fn upgrade_status_200_maps_to_proto() {
    let addr = canned_http_server("HTTP/1.1 200 OK");
    assert_eq!(dial_against(addr), Err(Error::Proto));
}

/// Handshake and speak raw RFC 6455 against our listener.
mod raw_client {
    use super::*;

    fn upgrade(addr: SocketAddr, path: &str) -> std::net::TcpStream {
        let mut conn = std::net::TcpStream::connect(addr).unwrap();
        let req = format!(
            "GET {path} HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        conn.write_all(req.as_bytes()).unwrap();

        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            conn.read_exact(&mut byte).unwrap();
            buf.push(byte[0]);
        }
        let head = String::from_utf8(buf).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected: {head}");
        assert!(head.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        conn
    }

    #[test]
    fn ping_gets_an_immediate_pong() {
        let addr = loopback();
        let listener = ws_listener(addr, "/ping", WsMode::Stream);
        listener.listen().unwrap();
        let accept_aio = Aio::new(|_| {});
        listener.accept(&accept_aio);

        let mut conn = upgrade(addr, "/ping");
        accept_aio.wait();
        accept_aio.result().unwrap();
        let _server = take_stream_output(&accept_aio).unwrap();

        // Masked PING with a 4-byte payload.
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        let mut payload = *b"ring";
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
        let mut frame = vec![0x89, 0x84];
        frame.extend_from_slice(&mask);
        frame.extend_from_slice(&payload);
        conn.write_all(&frame).unwrap();

        // Expect an unmasked PONG echoing the payload.
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).unwrap();
        assert_eq!(head[0], 0x8A);
        assert_eq!(head[1], 4);
        let mut pong = [0u8; 4];
        conn.read_exact(&mut pong).unwrap();
        assert_eq!(&pong, b"ring");

        listener.close();
    }

    #[test]
    fn unmasked_client_frame_closes_with_1002() {
        let addr = loopback();
        let listener = ws_listener(addr, "/strict", WsMode::Stream);
        listener.listen().unwrap();
        let accept_aio = Aio::new(|_| {});
        listener.accept(&accept_aio);

        let mut conn = upgrade(addr, "/strict");
        accept_aio.wait();
        accept_aio.result().unwrap();
        let _server = take_stream_output(&accept_aio).unwrap();

        // An unmasked data frame violates the client mask rule.
        conn.write_all(&[0x82, 0x02, b'h', b'i']).unwrap();

        // The server answers with a close frame carrying 1002.
        let mut head = [0u8; 2];
        conn.read_exact(&mut head).unwrap();
        assert_eq!(head[0], 0x88);
        assert_eq!(head[1], 2);
        let mut code = [0u8; 2];
        conn.read_exact(&mut code).unwrap();
        assert_eq!(u16::from_be_bytes(code), 1002);

        listener.close();
    }
}
