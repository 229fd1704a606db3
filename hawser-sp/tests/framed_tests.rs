//! Framed-message transport tests over loopback TCP.

use std::time::Duration;

use hawser_core::addr::Addr;
use hawser_core::aio::{Aio, Timeout};
use hawser_core::error::Error;
use hawser_core::msg::Msg;
use hawser_sp::framed::{SpEndpoint, SpPipe};
use hawser_sp::scheme;

fn loopback_addr() -> Addr {
    let port = portpicker::pick_unused_port().expect("no free port");
    Addr::parse(&format!("tcp://127.0.0.1:{port}")).unwrap()
}

fn ep_pair(addr: &Addr, proto: u16) -> (SpEndpoint, SpEndpoint) {
    let listener = SpEndpoint::listener(scheme::listener_for(addr, None).unwrap(), proto);
    listener.listen().unwrap();
    let dialer = SpEndpoint::dialer(scheme::dialer_for(addr, None).unwrap(), proto);
    (listener, dialer)
}

fn pipe_pair(listener: &SpEndpoint, dialer: &SpEndpoint) -> (SpPipe, SpPipe) {
    let accept_aio = Aio::new(|_| {});
    listener.accept(&accept_aio);

    let connect_aio = Aio::new(|_| {});
    dialer.connect(&connect_aio);

    accept_aio.wait();
    connect_aio.wait();
    accept_aio.result().unwrap();
    connect_aio.result().unwrap();

    let server: SpPipe = accept_aio.take_output_as(0).unwrap();
    let client: SpPipe = connect_aio.take_output_as(0).unwrap();
    (server, client)
}

fn send_msg(pipe: &SpPipe, msg: Msg) {
    let aio = Aio::new(|_| {});
    aio.set_msg(msg);
    pipe.send(&aio);
    aio.wait();
    aio.result().unwrap();
}

fn recv_msg(pipe: &SpPipe) -> Msg {
    let aio = Aio::new(|_| {});
    pipe.recv(&aio);
    aio.wait();
    aio.result().unwrap();
    aio.take_msg().unwrap()
}

#[test]
fn negotiation_exchanges_protocol_ids() {
    let addr = loopback_addr();
    let listener = SpEndpoint::listener(scheme::listener_for(&addr, None).unwrap(), 0x70);
    listener.listen().unwrap();
    let dialer = SpEndpoint::dialer(scheme::dialer_for(&addr, None).unwrap(), 0x31);

    let (server, client) = pipe_pair(&listener, &dialer);
    assert_eq!(server.peer(), 0x31);
    assert_eq!(client.peer(), 0x70);

    client.close();
    server.close();
}

#[test]
fn message_roundtrip() {
    let addr = loopback_addr();
    let (listener, dialer) = ep_pair(&addr, 0x70);
    let (server, client) = pipe_pair(&listener, &dialer);

    send_msg(&client, Msg::from_bytes(b"ahoy"));
    let got = recv_msg(&server);
    assert_eq!(got.body(), b"ahoy");

    // The other direction too.
    send_msg(&server, Msg::from_bytes(b"ahoy-back"));
    let got = recv_msg(&client);
    assert_eq!(got.body(), b"ahoy-back");

    client.close();
    server.close();
}

#[test]
fn header_and_body_concatenate_on_the_wire() {
    let addr = loopback_addr();
    let (listener, dialer) = ep_pair(&addr, 0x70);
    let (server, client) = pipe_pair(&listener, &dialer);

    let mut msg = Msg::from_bytes(b"body");
    msg.header_mut().extend_from_slice(b"hdr:");
    send_msg(&client, msg);

    // The receiver sees one opaque payload.
    let got = recv_msg(&server);
    assert_eq!(got.body(), b"hdr:body");
    assert_eq!(got.header_len(), 0);

    client.close();
    server.close();
}

#[test]
fn zero_length_messages_are_legal() {
    let addr = loopback_addr();
    let (listener, dialer) = ep_pair(&addr, 0x70);
    let (server, client) = pipe_pair(&listener, &dialer);

    send_msg(&client, Msg::new());
    let got = recv_msg(&server);
    assert!(got.is_empty());

    client.close();
    server.close();
}

#[test]
fn sends_complete_in_submission_order() {
    let addr = loopback_addr();
    let (listener, dialer) = ep_pair(&addr, 0x70);
    let (server, client) = pipe_pair(&listener, &dialer);

    let mut aios = Vec::new();
    for i in 0..20u8 {
        let aio = Aio::new(|_| {});
        aio.set_msg(Msg::from_bytes(&[i; 32]));
        client.send(&aio);
        aios.push(aio);
    }
    for aio in &aios {
        aio.wait();
        aio.result().unwrap();
    }
    for i in 0..20u8 {
        let got = recv_msg(&server);
        assert_eq!(got.body(), &[i; 32]);
    }

    client.close();
    server.close();
}

#[test]
fn oversize_message_fails_with_msgsize() {
    let addr = loopback_addr();
    let listener = SpEndpoint::listener(scheme::listener_for(&addr, None).unwrap(), 0x70);
    listener.set_recvmax(64);
    listener.listen().unwrap();
    let dialer = SpEndpoint::dialer(scheme::dialer_for(&addr, None).unwrap(), 0x70);

    let (server, client) = pipe_pair(&listener, &dialer);

    send_msg(&client, Msg::from_bytes(&[0u8; 128]));

    let aio = Aio::new(|_| {});
    server.recv(&aio);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::MsgSize));

    client.close();
    server.close();
}

#[test]
fn second_outstanding_accept_is_busy() {
    let addr = loopback_addr();
    let (listener, _dialer) = ep_pair(&addr, 0x70);

    let first = Aio::new(|_| {});
    listener.accept(&first);

    let second = Aio::new(|_| {});
    listener.accept(&second);
    second.wait();
    assert_eq!(second.result(), Err(Error::Busy));

    listener.close();
    first.wait();
    assert_eq!(first.result(), Err(Error::Closed));
}

#[test]
fn pipe_recv_timeout() {
    let addr = loopback_addr();
    let (listener, dialer) = ep_pair(&addr, 0x70);
    let (server, client) = pipe_pair(&listener, &dialer);

    let aio = Aio::new(|_| {});
    aio.set_timeout(Timeout::After(Duration::from_millis(50)));
    server.recv(&aio);
    aio.wait();
    assert_eq!(aio.result(), Err(Error::TimedOut));

    client.close();
    server.close();
}

#[test]
fn close_is_idempotent_and_fails_pending() {
    let addr = loopback_addr();
    let (listener, dialer) = ep_pair(&addr, 0x70);
    let (server, client) = pipe_pair(&listener, &dialer);

    let aio = Aio::new(|_| {});
    server.recv(&aio);
    server.close();
    server.close();
    aio.wait();
    assert!(aio.result().is_err());

    client.close();
}

#[cfg(unix)]
#[test]
fn message_roundtrip_over_ipc() {
    let path = std::env::temp_dir().join(format!("hawser-sp-{}.sock", std::process::id()));
    let addr = Addr::parse(&format!("ipc://{}", path.display())).unwrap();
    let (listener, dialer) = ep_pair(&addr, 0x70);
    let (server, client) = pipe_pair(&listener, &dialer);

    send_msg(&client, Msg::from_bytes(b"unix domain"));
    assert_eq!(recv_msg(&server).body(), b"unix domain");

    client.close();
    server.close();
    listener.close();
}
