//! The framed-message transport.
//!
//! Every stream-based transport (TCP, TLS, IPC, WebSocket) wears the same
//! framing over the byte-stream abstraction: an 8-byte negotiation header
//! exchanged at connection start, then length-prefixed messages. The pipe
//! state machine here is stream-generic; the scheme registry decides which
//! stream implementation sits underneath.
//!
//! Wire format:
//! - Negotiation: `00 53 50 00 PH PL 00 00`, where `PH:PL` is the owning
//!   socket's 16-bit protocol id, big-endian. Both peers send and then
//!   verify; a 10-second deadline bounds the exchange.
//! - Data: an 8-byte big-endian length equal to `header_len + body_len`,
//!   followed by that many bytes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use hawser_core::aio::{sleep_aio, Aio, Timeout};
use hawser_core::error::{Error, Result};
use hawser_core::msg::Msg;
use hawser_core::stream::{
    take_stream_output, PropValue, Stream, StreamDialer, StreamListener,
};

/// Deadline for the negotiation exchange.
const NEGO_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff before re-accepting after resource exhaustion.
const ACCEPT_COOLDOWN: Duration = Duration::from_millis(10);

fn nego_header(proto: u16) -> [u8; 8] {
    let p = proto.to_be_bytes();
    [0, b'S', b'P', 0, p[0], p[1], 0, 0]
}

fn parse_nego_header(buf: &[u8]) -> Result<u16> {
    if buf.len() != 8
        || buf[0] != 0
        || buf[1] != b'S'
        || buf[2] != b'P'
        || buf[3] != 0
        || buf[6] != 0
        || buf[7] != 0
    {
        return Err(Error::Proto);
    }
    Ok(u16::from_be_bytes([buf[4], buf[5]]))
}

enum NegoPhase {
    Send,
    Recv,
    Done,
}

/// One end of a framed-message connection.
///
/// Sends are strictly serialized; receives complete in submission order.
/// Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct SpPipe {
    inner: Arc<SpPipeInner>,
}

struct SpPipeInner {
    stream: Box<dyn Stream>,
    proto: u16,
    ep: Weak<SpEpInner>,
    closed: AtomicBool,
    st: Mutex<SpPipeState>,
    txaio: Aio,
    rxaio: Aio,
    negoaio: Aio,
    rx_msgs: AtomicU64,
    rx_bytes: AtomicU64,
    tx_msgs: AtomicU64,
    tx_bytes: AtomicU64,
}

struct SpPipeState {
    peer: u16,
    rcvmax: usize,
    sendq: VecDeque<Aio>,
    recvq: VecDeque<Aio>,
    /// Body length of the message currently transmitting.
    tx_len: usize,
    /// Reading the 8-byte length prefix (false) or the body (true).
    rx_body: bool,
    nego: NegoPhase,
}

impl SpPipe {
    /// Wrap a freshly connected stream and begin negotiation. The pipe
    /// joins the endpoint's negotiating list and moves to the waiting list
    /// when the peer's header checks out.
    fn start(stream: Box<dyn Stream>, ep: &Arc<SpEpInner>, proto: u16) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SpPipeInner>| {
            let w = weak.clone();
            let txaio = Aio::new(move |_| {
                if let Some(p) = w.upgrade() {
                    send_cb(&p);
                }
            });
            let w = weak.clone();
            let rxaio = Aio::new(move |_| {
                if let Some(p) = w.upgrade() {
                    recv_cb(&p);
                }
            });
            let w = weak.clone();
            let negoaio = Aio::new(move |_| {
                if let Some(p) = w.upgrade() {
                    nego_cb(&p);
                }
            });
            SpPipeInner {
                stream,
                proto,
                ep: Arc::downgrade(ep),
                closed: AtomicBool::new(false),
                st: Mutex::new(SpPipeState {
                    peer: 0,
                    rcvmax: 0,
                    sendq: VecDeque::new(),
                    recvq: VecDeque::new(),
                    tx_len: 0,
                    rx_body: false,
                    nego: NegoPhase::Send,
                }),
                txaio,
                rxaio,
                negoaio,
                rx_msgs: AtomicU64::new(0),
                rx_bytes: AtomicU64::new(0),
                tx_msgs: AtomicU64::new(0),
                tx_bytes: AtomicU64::new(0),
            }
        });

        let pipe = Self { inner };
        let hdr = Bytes::copy_from_slice(&nego_header(proto));
        pipe.inner.negoaio.set_timeout(Timeout::After(NEGO_TIMEOUT));
        let _ = pipe.inner.negoaio.set_iov(&[hdr]);
        pipe.inner.stream.send(&pipe.inner.negoaio);
        pipe
    }

    /// Peer protocol id captured during negotiation.
    #[must_use]
    pub fn peer(&self) -> u16 {
        self.inner.st.lock().peer
    }

    /// Queue a message send; the message travels in the AIO.
    pub fn send(&self, aio: &Aio) {
        aio.reset();
        let inner = self.inner.clone();
        let mut st = self.inner.st.lock();
        let started = aio.start(move |a, code| {
            let mut st = inner.st.lock();
            if let Some(pos) = st.sendq.iter().position(|q| q.ptr_eq(a)) {
                if pos == 0 {
                    // In flight; the transmit callback will see the abort.
                    inner.txaio.abort(code);
                } else {
                    st.sendq.remove(pos);
                    drop(st);
                    a.finish_error(code);
                }
            }
        });
        if !started {
            return;
        }
        if self.inner.closed.load(Ordering::Acquire) {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        st.sendq.push_back(aio.clone());
        if st.sendq.len() == 1 {
            send_start(&self.inner, &mut st);
        }
    }

    /// Queue a message receive; a complete message finishes the AIO.
    pub fn recv(&self, aio: &Aio) {
        aio.reset();
        let inner = self.inner.clone();
        let mut st = self.inner.st.lock();
        let started = aio.start(move |a, code| {
            let mut st = inner.st.lock();
            if let Some(pos) = st.recvq.iter().position(|q| q.ptr_eq(a)) {
                if pos == 0 {
                    inner.rxaio.abort(code);
                } else {
                    st.recvq.remove(pos);
                    drop(st);
                    a.finish_error(code);
                }
            }
        });
        if !started {
            return;
        }
        if self.inner.closed.load(Ordering::Acquire) {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        st.recvq.push_back(aio.clone());
        if st.recvq.len() == 1 {
            recv_start(&self.inner, &mut st);
        }
    }

    /// Close the connection; idempotent. Pending operations fail with
    /// `Closed`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.rxaio.close();
        self.inner.txaio.close();
        self.inner.negoaio.close();
        self.inner.stream.close();
    }

    /// Close, then wait for the internal callbacks to settle and detach
    /// from the endpoint lists.
    pub fn stop(&self) {
        self.close();
        self.inner.rxaio.stop();
        self.inner.txaio.stop();
        self.inner.negoaio.stop();
        self.inner.stream.stop();
        if let Some(ep) = self.inner.ep.upgrade() {
            let mut st = ep.st.lock();
            st.negopipes.retain(|p| !Arc::ptr_eq(&p.inner, &self.inner));
            st.waitpipes.retain(|p| !Arc::ptr_eq(&p.inner, &self.inner));
        }
    }

    /// Chainable property read (stream first, then transport state).
    pub fn get(&self, name: &str) -> Result<PropValue> {
        match self.inner.stream.get(name) {
            Err(Error::NotSup) => {}
            other => return other,
        }
        match name {
            hawser_core::stream::props::RECV_MAX => {
                Ok(PropValue::Size(self.inner.st.lock().rcvmax))
            }
            _ => Err(Error::NotSup),
        }
    }

    /// (rx msgs, rx bytes, tx msgs, tx bytes)
    #[must_use]
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        (
            self.inner.rx_msgs.load(Ordering::Relaxed),
            self.inner.rx_bytes.load(Ordering::Relaxed),
            self.inner.tx_msgs.load(Ordering::Relaxed),
            self.inner.tx_bytes.load(Ordering::Relaxed),
        )
    }

    fn set_rcvmax(&self, rcvmax: usize) {
        self.inner.st.lock().rcvmax = rcvmax;
    }
}

fn send_start(inner: &Arc<SpPipeInner>, st: &mut MutexGuard<'_, SpPipeState>) {
    let Some(aio) = st.sendq.front() else {
        return;
    };
    let msg = aio.take_msg().unwrap_or_default();
    let body_len = msg.len();
    let total = (body_len + msg.header_len()) as u64;
    st.tx_len = body_len;

    let mut segs: smallvec::SmallVec<[Bytes; 3]> = smallvec::SmallVec::new();
    segs.push(Bytes::copy_from_slice(&total.to_be_bytes()));
    let (header, body) = msg.freeze_parts();
    if !header.is_empty() {
        segs.push(header);
    }
    if !body.is_empty() {
        segs.push(body);
    }
    let _ = inner.txaio.set_iov(&segs);
    inner.stream.send(&inner.txaio);
}

fn send_cb(inner: &Arc<SpPipeInner>) {
    let mut st = inner.st.lock();
    let Some(aio) = st.sendq.front().cloned() else {
        return;
    };

    if let Err(rv) = inner.txaio.result() {
        // A partial transfer likely leaves the connection unusable; the
        // protocol sees the error and closes the pipe. No retry here.
        st.sendq.pop_front();
        drop(st);
        aio.finish_error(rv);
        return;
    }

    let n = inner.txaio.count();
    inner.txaio.iov_advance(n);
    if inner.txaio.iov_count() > 0 {
        inner.stream.send(&inner.txaio);
        return;
    }

    st.sendq.pop_front();
    let sent = st.tx_len;
    send_start(inner, &mut st);
    drop(st);

    inner.tx_msgs.fetch_add(1, Ordering::Relaxed);
    inner.tx_bytes.fetch_add(sent as u64, Ordering::Relaxed);
    aio.finish_sync(Ok(()), sent);
}

fn recv_start(inner: &Arc<SpPipeInner>, st: &mut MutexGuard<'_, SpPipeState>) {
    st.rx_body = false;
    inner.rxaio.set_recv(8);
    inner.stream.recv(&inner.rxaio);
}

fn recv_cb(inner: &Arc<SpPipeInner>) {
    let mut st = inner.st.lock();
    let Some(aio) = st.recvq.front().cloned() else {
        return;
    };

    let rv = match inner.rxaio.result() {
        Err(rv) => rv,
        Ok(()) => {
            if inner.rxaio.recv_remaining() > 0 {
                // Partial read; pick up where it left off.
                inner.stream.recv(&inner.rxaio);
                return;
            }
            if st.rx_body {
                // Complete message.
                let body = inner.rxaio.take_recv().unwrap_or_default();
                let msg = Msg::from_body(body);
                let n = msg.len();
                st.recvq.pop_front();
                st.rx_body = false;
                if !st.recvq.is_empty() {
                    recv_start(inner, &mut st);
                }
                drop(st);
                inner.rx_msgs.fetch_add(1, Ordering::Relaxed);
                inner.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
                aio.finish_msg_sync(msg);
                return;
            }

            // Length prefix complete.
            let hdr = inner.rxaio.take_recv().unwrap_or_default();
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(&hdr);
            let len = u64::from_be_bytes(len_bytes);

            if st.rcvmax > 0 && len > st.rcvmax as u64 {
                tracing::warn!(
                    len,
                    rcvmax = st.rcvmax,
                    "oversize message; closing pipe"
                );
                Error::MsgSize
            } else if len == 0 {
                // Zero-length messages are legal.
                st.recvq.pop_front();
                if !st.recvq.is_empty() {
                    recv_start(inner, &mut st);
                }
                drop(st);
                inner.rx_msgs.fetch_add(1, Ordering::Relaxed);
                aio.finish_msg_sync(Msg::new());
                return;
            } else {
                st.rx_body = true;
                inner.rxaio.set_recv(len as usize);
                inner.stream.recv(&inner.rxaio);
                return;
            }
        }
    };

    // Receive error: fail the waiting aio and stop pulling. The protocol
    // notices and closes the pipe.
    st.recvq.pop_front();
    st.rx_body = false;
    let _ = inner.rxaio.take_recv();
    drop(st);
    aio.finish_error(rv);
}

fn nego_cb(inner: &Arc<SpPipeInner>) {
    let Some(ep) = inner.ep.upgrade() else {
        inner.stream.close();
        return;
    };
    let mut est = ep.st.lock();

    let mut failure = if est.closed {
        Some(Error::Closed)
    } else {
        inner.negoaio.result().err()
    };

    if failure.is_none() {
        let mut pst = inner.st.lock();
        match pst.nego {
            NegoPhase::Send => {
                let n = inner.negoaio.count();
                inner.negoaio.iov_advance(n);
                if inner.negoaio.iov_count() > 0 {
                    drop(pst);
                    drop(est);
                    inner.stream.send(&inner.negoaio);
                    return;
                }
                pst.nego = NegoPhase::Recv;
                inner.negoaio.set_recv(8);
                drop(pst);
                drop(est);
                inner.stream.recv(&inner.negoaio);
                return;
            }
            NegoPhase::Recv => {
                if inner.negoaio.recv_remaining() > 0 {
                    drop(pst);
                    drop(est);
                    inner.stream.recv(&inner.negoaio);
                    return;
                }
                let hdr = inner.negoaio.take_recv().unwrap_or_default();
                match parse_nego_header(&hdr) {
                    Ok(peer) => {
                        pst.peer = peer;
                        pst.nego = NegoPhase::Done;
                    }
                    Err(e) => failure = Some(e),
                }
            }
            NegoPhase::Done => return,
        }
    }

    if let Some(rv) = failure {
        // A closed status here would be confused with the accept socket
        // being closed; report the peer connection as shut down instead.
        let rv = if rv == Error::Closed { Error::ConnShut } else { rv };
        est.negopipes.retain(|p| !Arc::ptr_eq(&p.inner, &inner));
        inner.stream.close();
        let uaio = est.useraio.take();
        drop(est);
        if let Some(uaio) = uaio {
            uaio.finish_error(rv);
        }
        return;
    }

    // Negotiated: move to the waiting list and try to match a user aio.
    let me = {
        let pos = est
            .negopipes
            .iter()
            .position(|p| Arc::ptr_eq(&p.inner, &inner));
        pos.map(|i| est.negopipes.remove(i))
    };
    if let Some(pipe) = me {
        est.waitpipes.push(pipe);
    }
    let matched = ep_match(&mut est);
    drop(est);
    if let Some((uaio, pipe)) = matched {
        uaio.set_output(0, Box::new(pipe));
        uaio.finish(Ok(()), 0);
    }
}

/// Match a negotiated pipe to the pending user connect/accept, if both
/// exist. The completion runs outside the endpoint lock.
fn ep_match(est: &mut MutexGuard<'_, EpState>) -> Option<(Aio, SpPipe)> {
    if est.useraio.is_none() || est.waitpipes.is_empty() {
        return None;
    }
    let pipe = est.waitpipes.remove(0);
    let uaio = est.useraio.take()?;
    pipe.set_rcvmax(est.rcvmax);
    Some((uaio, pipe))
}

enum EpKind {
    Dialer(Box<dyn StreamDialer>),
    Listener(Box<dyn StreamListener>),
}

/// A framed-message endpoint: the dialer or listener half of a socket
/// endpoint, producing negotiated pipes.
#[derive(Clone)]
pub struct SpEndpoint {
    inner: Arc<SpEpInner>,
}

struct SpEpInner {
    kind: EpKind,
    proto: u16,
    st: Mutex<EpState>,
    connaio: Aio,
    timeaio: Aio,
}

struct EpState {
    closed: bool,
    started: bool,
    rcvmax: usize,
    useraio: Option<Aio>,
    negopipes: Vec<SpPipe>,
    waitpipes: Vec<SpPipe>,
}

impl SpEndpoint {
    fn new(kind: EpKind, proto: u16) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SpEpInner>| {
            let w = weak.clone();
            let connaio = Aio::new(move |_| {
                if let Some(ep) = w.upgrade() {
                    conn_cb(&ep);
                }
            });
            let w = weak.clone();
            let timeaio = Aio::new(move |_| {
                if let Some(ep) = w.upgrade() {
                    timer_cb(&ep);
                }
            });
            SpEpInner {
                kind,
                proto,
                st: Mutex::new(EpState {
                    closed: false,
                    started: false,
                    rcvmax: 0,
                    useraio: None,
                    negopipes: Vec::new(),
                    waitpipes: Vec::new(),
                }),
                connaio,
                timeaio,
            }
        });
        Self { inner }
    }

    #[must_use]
    pub fn dialer(d: Box<dyn StreamDialer>, proto: u16) -> Self {
        Self::new(EpKind::Dialer(d), proto)
    }

    #[must_use]
    pub fn listener(l: Box<dyn StreamListener>, proto: u16) -> Self {
        Self::new(EpKind::Listener(l), proto)
    }

    /// Bind the listening socket. Listener endpoints only.
    pub fn listen(&self) -> Result<()> {
        match &self.inner.kind {
            EpKind::Listener(l) => l.listen(),
            EpKind::Dialer(_) => Err(Error::NotSup),
        }
    }

    /// Start one connect attempt; the negotiated pipe arrives in output
    /// slot 0. At most one user connect/accept may be outstanding.
    pub fn connect(&self, aio: &Aio) {
        let EpKind::Dialer(ref d) = self.inner.kind else {
            aio.reset();
            aio.finish_error(Error::NotSup);
            return;
        };
        aio.reset();
        let inner = self.inner.clone();
        let mut st = self.inner.st.lock();
        if st.closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        if st.useraio.is_some() {
            drop(st);
            aio.finish_error(Error::Busy);
            return;
        }
        let started = aio.start(move |a, code| {
            let mut st = inner.st.lock();
            if st.useraio.as_ref().is_some_and(|u| u.ptr_eq(a)) {
                st.useraio = None;
                drop(st);
                a.finish_error(code);
            }
        });
        if !started {
            return;
        }
        st.useraio = Some(aio.clone());
        drop(st);
        d.dial(&self.inner.connaio);
    }

    /// Wait for the next inbound pipe; the first call also starts the
    /// standing accept. At most one user connect/accept may be
    /// outstanding.
    pub fn accept(&self, aio: &Aio) {
        let EpKind::Listener(ref l) = self.inner.kind else {
            aio.reset();
            aio.finish_error(Error::NotSup);
            return;
        };
        aio.reset();
        let inner = self.inner.clone();
        let mut st = self.inner.st.lock();
        if st.closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        if st.useraio.is_some() {
            drop(st);
            aio.finish_error(Error::Busy);
            return;
        }
        let started = aio.start(move |a, code| {
            let mut st = inner.st.lock();
            if st.useraio.as_ref().is_some_and(|u| u.ptr_eq(a)) {
                st.useraio = None;
                drop(st);
                a.finish_error(code);
            }
        });
        if !started {
            return;
        }
        st.useraio = Some(aio.clone());
        if st.started {
            let matched = ep_match(&mut st);
            drop(st);
            if let Some((uaio, pipe)) = matched {
                uaio.set_output(0, Box::new(pipe));
                uaio.finish(Ok(()), 0);
            }
        } else {
            st.started = true;
            drop(st);
            l.accept(&self.inner.connaio);
        }
    }

    /// Cap on a single inbound message; 0 is unlimited. Applied to pipes
    /// as they are matched.
    pub fn set_recvmax(&self, rcvmax: usize) {
        self.inner.st.lock().rcvmax = rcvmax;
    }

    #[must_use]
    pub fn recvmax(&self) -> usize {
        self.inner.st.lock().rcvmax
    }

    /// Property chain: endpoint first, then the underlying stream factory.
    pub fn get(&self, name: &str) -> Result<PropValue> {
        if name == hawser_core::stream::props::RECV_MAX {
            return Ok(PropValue::Size(self.recvmax()));
        }
        match &self.inner.kind {
            EpKind::Dialer(d) => d.get(name),
            EpKind::Listener(l) => l.get(name),
        }
    }

    pub fn set(&self, name: &str, value: PropValue) -> Result<()> {
        if name == hawser_core::stream::props::RECV_MAX {
            self.set_recvmax(value.as_size()?);
            return Ok(());
        }
        match &self.inner.kind {
            EpKind::Dialer(d) => d.set(name, value),
            EpKind::Listener(l) => l.set(name, value),
        }
    }

    pub fn close(&self) {
        let (uaio, pipes) = {
            let mut st = self.inner.st.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            let mut pipes = Vec::new();
            pipes.extend(st.negopipes.iter().cloned());
            pipes.extend(st.waitpipes.iter().cloned());
            (st.useraio.take(), pipes)
        };
        self.inner.timeaio.close();
        self.inner.connaio.close();
        match &self.inner.kind {
            EpKind::Dialer(d) => d.close(),
            EpKind::Listener(l) => l.close(),
        }
        for pipe in pipes {
            pipe.close();
        }
        if let Some(uaio) = uaio {
            uaio.finish_error(Error::Closed);
        }
    }

    pub fn stop(&self) {
        self.close();
        self.inner.timeaio.stop();
        self.inner.connaio.stop();
        match &self.inner.kind {
            EpKind::Dialer(d) => d.stop(),
            EpKind::Listener(l) => l.stop(),
        }
    }
}

fn conn_cb(inner: &Arc<SpEpInner>) {
    let aio = &inner.connaio;
    let mut st = inner.st.lock();

    let rv = match aio.result() {
        Ok(()) => {
            let stream = take_stream_output(aio);
            if st.closed {
                drop(st);
                if let Some(s) = stream {
                    s.close();
                }
                return;
            }
            match stream {
                Some(stream) => {
                    let pipe = SpPipe::start(stream, inner, inner.proto);
                    st.negopipes.push(pipe);
                    if let EpKind::Listener(ref l) = inner.kind {
                        l.accept(aio);
                    }
                    return;
                }
                None => Error::NoMem,
            }
        }
        Err(rv) => rv,
    };

    // Surface the failure through the user aio, then apply the retry
    // policy for listeners.
    let uaio = st.useraio.take();
    match inner.kind {
        EpKind::Dialer(_) => {}
        EpKind::Listener(ref l) => match rv {
            Error::Closed | Error::Stopped => {}
            Error::NoMem | Error::NoFiles => {
                // Cool down before re-accepting, to avoid spinning.
                sleep_aio(ACCEPT_COOLDOWN, &inner.timeaio);
            }
            _ => {
                if !st.closed {
                    l.accept(aio);
                }
            }
        },
    }
    drop(st);
    if let Some(uaio) = uaio {
        uaio.finish_error(rv);
    }
}

fn timer_cb(inner: &Arc<SpEpInner>) {
    if inner.timeaio.result().is_ok() {
        if let EpKind::Listener(ref l) = inner.kind {
            let st = inner.st.lock();
            if !st.closed {
                l.accept(&inner.connaio);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nego_header_layout() {
        let hdr = nego_header(0x70);
        assert_eq!(hdr, [0, b'S', b'P', 0, 0x00, 0x70, 0, 0]);
    }

    #[test]
    fn test_nego_header_roundtrip() {
        let hdr = nego_header(0xA1B2);
        assert_eq!(parse_nego_header(&hdr), Ok(0xA1B2));
    }

    #[test]
    fn test_nego_header_rejects_bad_magic() {
        let mut hdr = nego_header(0x70);
        hdr[1] = b'X';
        assert_eq!(parse_nego_header(&hdr), Err(Error::Proto));

        let mut hdr = nego_header(0x70);
        hdr[7] = 1;
        assert_eq!(parse_nego_header(&hdr), Err(Error::Proto));
    }
}
