//! WebSocket connections, dialer, and listener.
//!
//! A connection owns the upgraded byte stream and runs the RFC 6455 frame
//! machine over it with two internal AIOs. Bytes that arrived in the same
//! read as the HTTP head are kept in a pre-stash the frame reader drains
//! first. Control frames jump the transmit queue; close performs the
//! two-way close handshake with a short drain deadline.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use rand::RngCore;
use smallvec::SmallVec;

use hawser_core::aio::{Aio, Completions, Timeout};
use hawser_core::error::{Error, Result};
use hawser_core::msg::Msg;
use hawser_core::stream::{
    take_stream_output, PropValue, Stream, StreamDialer, StreamListener,
};

use super::frame::{
    apply_mask, close_code, encode_head, make_accept, make_key, HeadFixed, Opcode,
    MAX_CONTROL_LEN,
};
use super::http::{self, Request, Response};
use super::{props, HEADER_PROP_PREFIX};

/// Default cap on an assembled message (message mode).
const DEF_RECVMAX: usize = 1 << 20;
/// Default cap on a single inbound frame.
const DEF_MAXFRAME: usize = 1 << 20;
/// Default outbound fragmentation threshold.
const DEF_FRAGSIZE: usize = 64 * 1024;

/// Give the close handshake this long to drain.
const CLOSE_DRAIN: Duration = Duration::from_millis(100);
/// Deadline on the HTTP upgrade exchange.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(2);

/// Read chunk while hunting for the end of an HTTP head.
const HTTP_READ_CHUNK: usize = 1024;

/// User-visible framing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsMode {
    /// Byte-stream semantics across arbitrary frame boundaries.
    Stream,
    /// One whole assembled message per receive.
    Message,
}

/// Tunables shared by dialers and listeners, applied to each connection.
#[derive(Debug, Clone)]
struct WsOpts {
    recvmax: usize,
    maxframe: usize,
    fragsize: usize,
    recv_text: bool,
    send_text: bool,
    protocol: Option<String>,
    headers: Vec<(String, String)>,
}

impl Default for WsOpts {
    fn default() -> Self {
        Self {
            recvmax: DEF_RECVMAX,
            maxframe: DEF_MAXFRAME,
            fragsize: DEF_FRAGSIZE,
            recv_text: false,
            send_text: false,
            protocol: None,
            headers: Vec::new(),
        }
    }
}

impl WsOpts {
    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            props::RECVMAX_FRAME => Ok(PropValue::Size(self.maxframe)),
            props::SENDMAX_FRAME => Ok(PropValue::Size(self.fragsize)),
            hawser_core::stream::props::RECV_MAX => Ok(PropValue::Size(self.recvmax)),
            props::RECV_TEXT => Ok(PropValue::Bool(self.recv_text)),
            props::SEND_TEXT => Ok(PropValue::Bool(self.send_text)),
            props::PROTOCOL => self
                .protocol
                .clone()
                .map(PropValue::Str)
                .ok_or(Error::NotSup),
            _ => {
                if let Some(h) = name.strip_prefix(HEADER_PROP_PREFIX) {
                    return http::get_header(&self.headers, h)
                        .map(|v| PropValue::Str(v.to_string()))
                        .ok_or(Error::NotSup);
                }
                Err(Error::NotSup)
            }
        }
    }

    fn set(&mut self, name: &str, value: &PropValue) -> Result<()> {
        match name {
            props::RECVMAX_FRAME => self.maxframe = value.as_size()?,
            props::SENDMAX_FRAME => self.fragsize = value.as_size()?,
            hawser_core::stream::props::RECV_MAX => self.recvmax = value.as_size()?,
            props::RECV_TEXT => self.recv_text = value.as_bool()?,
            props::SEND_TEXT => self.send_text = value.as_bool()?,
            props::PROTOCOL => self.protocol = Some(value.as_str()?.to_string()),
            _ => {
                if let Some(h) = name.strip_prefix(HEADER_PROP_PREFIX) {
                    http::set_header(&mut self.headers, h, value.as_str()?);
                    return Ok(());
                }
                return Err(Error::NotSup);
            }
        }
        Ok(())
    }
}

struct TxFrame {
    head: [u8; 14],
    hlen: usize,
    payload: Bytes,
    op: Opcode,
    fin: bool,
    /// User aio for data frames; control frames carry none.
    aio: Option<Aio>,
}

struct RxFrame {
    payload: BytesMut,
}

enum RxPhase {
    Head2,
    HeadExt,
    Payload,
}

struct RxPartial {
    phase: RxPhase,
    fx: HeadFixed,
    mask: [u8; 4],
}

impl RxPartial {
    fn new() -> Self {
        Self {
            phase: RxPhase::Head2,
            fx: HeadFixed {
                op: Opcode::Cont,
                fin: false,
                masked: false,
                short_len: 0,
            },
            mask: [0; 4],
        }
    }
}

struct WsState {
    txq: VecDeque<TxFrame>,
    txframe: Option<TxFrame>,
    rxq: VecDeque<RxFrame>,
    rxframe: Option<RxPartial>,
    sendq: VecDeque<Aio>,
    recvq: VecDeque<Aio>,
    /// Pre-read bytes that followed the HTTP head on the wire.
    pre: BytesMut,
    inmsg: bool,
    ready: bool,
    /// We queued/sent our close frame; no further user traffic.
    closed: bool,
    peer_closed: bool,
    /// Close aio armed, waiting for the handshake to drain.
    wclose: bool,
    /// Hard failure; the connection is torn down.
    dead: bool,
}

/// One WebSocket connection, presented as a byte stream (stream mode) or
/// message pipe (message mode).
pub struct WsStream {
    inner: Arc<WsInner>,
}

struct WsInner {
    http: Box<dyn Stream>,
    server: bool,
    mode: WsMode,
    recvmax: usize,
    maxframe: usize,
    fragsize: usize,
    recv_text: bool,
    send_text: bool,
    st: Mutex<WsState>,
    txaio: Aio,
    rxaio: Aio,
    closeaio: Aio,
    /// Request and response headers as seen on the wire.
    req_headers: Vec<(String, String)>,
    resp_headers: Vec<(String, String)>,
}

impl WsStream {
    #[allow(clippy::too_many_arguments)]
    fn new(
        http: Box<dyn Stream>,
        server: bool,
        mode: WsMode,
        opts: &WsOpts,
        pre: BytesMut,
        req_headers: Vec<(String, String)>,
        resp_headers: Vec<(String, String)>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<WsInner>| {
            let w = weak.clone();
            let txaio = Aio::new(move |_| {
                if let Some(c) = w.upgrade() {
                    tx_cb(&c);
                }
            });
            let w = weak.clone();
            let rxaio = Aio::new(move |_| {
                if let Some(c) = w.upgrade() {
                    rx_cb(&c);
                }
            });
            let w = weak.clone();
            let closeaio = Aio::new(move |_| {
                if let Some(c) = w.upgrade() {
                    close_cb(&c);
                }
            });
            closeaio.set_timeout(Timeout::After(CLOSE_DRAIN));
            WsInner {
                http,
                server,
                mode,
                recvmax: opts.recvmax,
                maxframe: opts.maxframe,
                fragsize: opts.fragsize,
                recv_text: opts.recv_text,
                send_text: opts.send_text,
                st: Mutex::new(WsState {
                    txq: VecDeque::new(),
                    txframe: None,
                    rxq: VecDeque::new(),
                    rxframe: None,
                    sendq: VecDeque::new(),
                    recvq: VecDeque::new(),
                    pre,
                    inmsg: false,
                    ready: true,
                    closed: false,
                    peer_closed: false,
                    wclose: false,
                    dead: false,
                }),
                txaio,
                rxaio,
                closeaio,
                req_headers,
                resp_headers,
            }
        });

        // Start pulling frames; pre-stashed bytes may already hold some.
        let mut done = Completions::new();
        {
            let mut st = inner.st.lock();
            rx_resume(&inner, &mut st, &mut done);
        }
        done.run();

        Self { inner }
    }
}

/// Feed the receive window from the pre-stash, then the stream. True when
/// the window filled synchronously and processing may continue.
fn arm_read(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>, want: usize) -> bool {
    inner.rxaio.set_recv(want);
    if !st.pre.is_empty() {
        let n = want.min(st.pre.len());
        let chunk = st.pre.split_to(n);
        inner.rxaio.recv_append(&chunk);
    }
    if inner.rxaio.recv_remaining() == 0 {
        true
    } else {
        inner.http.recv(&inner.rxaio);
        false
    }
}

/// Begin reading the next frame unless busy, closed, or backpressured.
/// True when header bytes are already available from the pre-stash.
fn maybe_start_read(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>) -> bool {
    if st.rxframe.is_some() || st.closed || st.dead {
        return false;
    }
    // With a data frame queued and nobody waiting, reading on would
    // buffer without bound.
    if st.recvq.is_empty() && !st.rxq.is_empty() {
        return false;
    }
    st.rxframe = Some(RxPartial::new());
    arm_read(inner, st, 2)
}

fn rx_resume(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>, done: &mut Completions) {
    if maybe_start_read(inner, st) {
        rx_step(inner, st, done);
    }
}

/// Consume the completed receive window and advance the frame machine.
/// Loops for as long as the pre-stash keeps satisfying reads.
fn rx_step(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>, done: &mut Completions) {
    loop {
        let Some(mut fr) = st.rxframe.take() else {
            return;
        };
        match fr.phase {
            RxPhase::Head2 => {
                let buf = inner.rxaio.take_recv().unwrap_or_default();
                let fx = match HeadFixed::decode(buf[0], buf[1]) {
                    Ok(fx) => fx,
                    Err(_) => {
                        ws_close(inner, st, done, close_code::PROTOCOL_ERR);
                        return;
                    }
                };
                fr.fx = fx;
                let need = fx.ext_len();
                if need > 0 {
                    fr.phase = RxPhase::HeadExt;
                    st.rxframe = Some(fr);
                    if !arm_read(inner, st, need) {
                        return;
                    }
                    continue;
                }
                if !finish_header(inner, st, done, fr, &[]) {
                    return;
                }
            }
            RxPhase::HeadExt => {
                let ext = inner.rxaio.take_recv().unwrap_or_default();
                if !finish_header(inner, st, done, fr, &ext) {
                    return;
                }
            }
            RxPhase::Payload => {
                let mut payload = inner.rxaio.take_recv().unwrap_or_default();
                if fr.fx.masked {
                    apply_mask(fr.mask, &mut payload);
                }
                handle_frame(inner, st, done, fr.fx.op, fr.fx.fin, payload);
                read_finish(inner, st, done);
                if !maybe_start_read(inner, st) {
                    return;
                }
            }
        }
    }
}

/// Validate a complete header, then arm the payload read or complete an
/// empty frame. False stops the processing loop.
fn finish_header(
    inner: &Arc<WsInner>,
    st: &mut MutexGuard<'_, WsState>,
    done: &mut Completions,
    mut fr: RxPartial,
    ext: &[u8],
) -> bool {
    let fx = fr.fx;
    let len = match fx.payload_len(ext) {
        Ok(len) => len,
        Err(_) => {
            ws_close(inner, st, done, close_code::PROTOCOL_ERR);
            return false;
        }
    };

    if inner.maxframe > 0 && len > inner.maxframe as u64 {
        ws_close(inner, st, done, close_code::TOO_BIG);
        return false;
    }
    // In message mode an endless stream of small frames must not defeat
    // the message limit either.
    if inner.mode == WsMode::Message && inner.recvmax > 0 {
        let queued: u64 = st.rxq.iter().map(|f| f.payload.len() as u64).sum();
        if queued + len > inner.recvmax as u64 {
            ws_close(inner, st, done, close_code::TOO_BIG);
            return false;
        }
    }

    // Mask discipline: servers require masked frames, clients unmasked.
    if fx.masked {
        if !inner.server {
            ws_close(inner, st, done, close_code::PROTOCOL_ERR);
            return false;
        }
        fr.mask = fx.mask_key(ext);
    } else if inner.server {
        ws_close(inner, st, done, close_code::PROTOCOL_ERR);
        return false;
    }

    if len > 0 {
        fr.phase = RxPhase::Payload;
        st.rxframe = Some(fr);
        return arm_read(inner, st, len as usize);
    }

    handle_frame(inner, st, done, fx.op, fx.fin, BytesMut::new());
    read_finish(inner, st, done);
    maybe_start_read(inner, st)
}

fn handle_frame(
    inner: &Arc<WsInner>,
    st: &mut MutexGuard<'_, WsState>,
    done: &mut Completions,
    op: Opcode,
    fin: bool,
    payload: BytesMut,
) {
    match op {
        Opcode::Cont => {
            if !st.inmsg {
                ws_close(inner, st, done, close_code::PROTOCOL_ERR);
                return;
            }
            if fin {
                st.inmsg = false;
            }
            st.rxq.push_back(RxFrame { payload });
        }
        Opcode::Text if !inner.recv_text => {
            ws_close(inner, st, done, close_code::UNSUPP_FORMAT);
        }
        Opcode::Text | Opcode::Binary => {
            if st.inmsg {
                ws_close(inner, st, done, close_code::PROTOCOL_ERR);
                return;
            }
            if !fin {
                st.inmsg = true;
            }
            st.rxq.push_back(RxFrame { payload });
        }
        Opcode::Ping => {
            if payload.len() > MAX_CONTROL_LEN {
                ws_close(inner, st, done, close_code::PROTOCOL_ERR);
                return;
            }
            send_control(inner, st, Opcode::Pong, &payload);
        }
        Opcode::Pong => {
            if payload.len() > MAX_CONTROL_LEN {
                ws_close(inner, st, done, close_code::PROTOCOL_ERR);
            }
            // Discarded otherwise.
        }
        Opcode::Close => {
            st.peer_closed = true;
            if st.closed {
                // This answers our close; the handshake is complete.
                if st.wclose {
                    st.wclose = false;
                    inner.closeaio.finish(Ok(()), 0);
                }
            } else {
                ws_close(inner, st, done, close_code::NORMAL);
            }
        }
    }
}

/// Deliver buffered frames to waiting receives.
fn read_finish(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>, done: &mut Completions) {
    match inner.mode {
        WsMode::Stream => loop {
            if st.recvq.is_empty() {
                return;
            }
            // Zero length frames carry nothing in stream mode.
            while st.rxq.front().is_some_and(|f| f.payload.is_empty()) {
                st.rxq.pop_front();
            }
            if st.rxq.is_empty() {
                return;
            }
            let aio = st.recvq.pop_front().unwrap();
            let mut want = aio.recv_remaining();
            let mut count = 0usize;
            while want > 0 {
                let Some(frame) = st.rxq.front_mut() else {
                    break;
                };
                let n = want.min(frame.payload.len());
                let chunk = frame.payload.split_to(n);
                aio.recv_append(&chunk);
                count += n;
                want -= n;
                if frame.payload.is_empty() {
                    st.rxq.pop_front();
                }
            }
            done.add(aio, Ok(()), count);
        },
        WsMode::Message => {
            if st.inmsg || st.rxq.is_empty() || st.recvq.is_empty() {
                return;
            }
            let total: usize = st.rxq.iter().map(|f| f.payload.len()).sum();
            let mut body = BytesMut::with_capacity(total);
            for frame in st.rxq.drain(..) {
                body.extend_from_slice(&frame.payload);
            }
            let aio = st.recvq.pop_front().unwrap();
            aio.set_msg(Msg::from_body(body));
            done.add(aio, Ok(()), total);
        }
    }
}

fn client_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Build the next data frame for a user send, consuming up to `fragsize`
/// bytes of its transmit vector.
fn prep_data_frame(inner: &Arc<WsInner>, aio: &Aio) -> TxFrame {
    let segs = aio.iov();
    let total: usize = segs.iter().map(Bytes::len).sum();
    let (len, fin) = if inner.fragsize > 0 && total > inner.fragsize {
        // Stream mode constrains itself to one frame per operation; the
        // submitter sees a partial transmit and resubmits. Message mode
        // keeps fragmenting until the message is out.
        (inner.fragsize, inner.mode == WsMode::Stream)
    } else {
        (total, true)
    };

    let mut payload = BytesMut::with_capacity(len);
    let mut need = len;
    for seg in &segs {
        if need == 0 {
            break;
        }
        let n = need.min(seg.len());
        payload.extend_from_slice(&seg[..n]);
        need -= n;
    }

    let op = if aio.count() == 0 {
        if inner.send_text {
            Opcode::Text
        } else {
            Opcode::Binary
        }
    } else {
        Opcode::Cont
    };

    let mask = if inner.server {
        None
    } else {
        let key = client_mask();
        apply_mask(key, &mut payload);
        Some(key)
    };
    let (head, hlen) = encode_head(op, fin, len, mask);
    TxFrame {
        head,
        hlen,
        payload: payload.freeze(),
        op,
        fin,
        aio: Some(aio.clone()),
    }
}

fn control_frame(inner: &Arc<WsInner>, op: Opcode, payload: &[u8]) -> TxFrame {
    let mut body = BytesMut::from(payload);
    let mask = if inner.server {
        None
    } else {
        let key = client_mask();
        apply_mask(key, &mut body);
        Some(key)
    };
    let (head, hlen) = encode_head(op, true, body.len(), mask);
    TxFrame {
        head,
        hlen,
        payload: body.freeze(),
        op,
        fin: true,
        aio: None,
    }
}

/// Control frames are enqueued at the head of the transmit queue.
fn send_control(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>, op: Opcode, payload: &[u8]) {
    if st.closed || st.dead || payload.len() > MAX_CONTROL_LEN {
        return;
    }
    let frame = control_frame(inner, op, payload);
    st.txq.push_front(frame);
    start_write(inner, st);
}

/// Queue our close frame and arm the drain deadline.
fn send_close(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>, code: u16) {
    if st.closed || !st.ready || st.dead {
        return;
    }
    st.closed = true;

    inner.closeaio.reset();
    st.wclose = true;
    let hook = inner.clone();
    let armed = inner.closeaio.start(move |a, code| {
        let finish = {
            let mut st = hook.st.lock();
            if st.wclose {
                st.wclose = false;
                true
            } else {
                false
            }
        };
        if finish {
            a.finish_error(code);
        }
    });
    if !armed {
        st.wclose = false;
        return;
    }

    let frame = control_frame(inner, Opcode::Close, &code.to_be_bytes());
    st.txq.push_front(frame);
    start_write(inner, st);
}

/// Stop receiving and begin the close handshake.
fn ws_close(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>, done: &mut Completions, code: u16) {
    for aio in st.recvq.drain(..) {
        done.add(aio, Err(Error::Closed), 0);
    }
    send_close(inner, st, code);
}

/// Hard teardown after a transport failure: no close handshake possible.
fn ws_fail(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>, done: &mut Completions, code: Error) {
    if st.dead {
        return;
    }
    st.dead = true;
    st.closed = true;
    for aio in st.recvq.drain(..) {
        done.add(aio, Err(code.clone()), 0);
    }
    drain_tx(st, done, &code);
    if st.wclose {
        // Settle the drain deadline through the completion list; its
        // cancel hook takes this lock, so it must not run from here.
        st.wclose = false;
        done.add(inner.closeaio.clone(), Err(Error::Closed), 0);
    }
    inner.http.close();
}

/// Fail every queued transmit.
fn drain_tx(st: &mut MutexGuard<'_, WsState>, done: &mut Completions, code: &Error) {
    while let Some(frame) = st.txq.pop_front() {
        if let Some(aio) = frame.aio {
            if let Some(pos) = st.sendq.iter().position(|q| q.ptr_eq(&aio)) {
                st.sendq.remove(pos);
            }
            done.add(aio, Err(code.clone()), 0);
        }
    }
}

fn start_write(inner: &Arc<WsInner>, st: &mut MutexGuard<'_, WsState>) {
    if st.txframe.is_some() || !st.ready || st.dead {
        return;
    }
    let Some(frame) = st.txq.pop_front() else {
        return;
    };

    let mut segs: SmallVec<[Bytes; 2]> = SmallVec::new();
    segs.push(Bytes::copy_from_slice(&frame.head[..frame.hlen]));
    if !frame.payload.is_empty() {
        segs.push(frame.payload.clone());
    }
    let _ = inner.txaio.set_iov(&segs);
    st.txframe = Some(frame);
    inner.http.send(&inner.txaio);
}

fn tx_cb(inner: &Arc<WsInner>) {
    let mut done = Completions::new();
    {
        let mut st = inner.st.lock();
        let Some(frame) = st.txframe.take() else {
            return;
        };

        match inner.txaio.result() {
            Err(rv) => {
                if frame.op == Opcode::Close {
                    ws_fail(inner, &mut st, &mut done, rv);
                } else {
                    // A partial frame is unrecoverable; no close frame
                    // can be sent either.
                    if let Some(aio) = &frame.aio {
                        if let Some(pos) = st.sendq.iter().position(|q| q.ptr_eq(aio)) {
                            st.sendq.remove(pos);
                        }
                        done.add(aio.clone(), Err(rv.clone()), 0);
                    }
                    ws_fail(inner, &mut st, &mut done, rv);
                }
            }
            Ok(()) => {
                let n = inner.txaio.count();
                inner.txaio.iov_advance(n);
                if inner.txaio.iov_count() > 0 {
                    st.txframe = Some(frame);
                    inner.http.send(&inner.txaio);
                    drop(st);
                    done.run();
                    return;
                }

                if frame.op == Opcode::Close {
                    // Our close is out; nothing else may follow it.
                    drain_tx(&mut st, &mut done, &Error::Closed);
                    if st.peer_closed && st.wclose {
                        st.wclose = false;
                        inner.closeaio.finish(Ok(()), 0);
                    }
                    drop(st);
                    done.run();
                    return;
                }

                let payload_len = frame.payload.len();
                if let Some(aio) = frame.aio {
                    aio.iov_advance(payload_len);
                    aio.bump_count(payload_len);
                    if frame.fin {
                        if let Some(pos) = st.sendq.iter().position(|q| q.ptr_eq(&aio)) {
                            st.sendq.remove(pos);
                        }
                        // A message rode in on the aio; it is spent now.
                        let _ = aio.take_msg();
                        let count = aio.count();
                        done.add(aio, Ok(()), count);
                    } else {
                        // More fragments to go; scheduled at the tail so
                        // control frames can interleave.
                        let next = prep_data_frame(inner, &aio);
                        st.txq.push_back(next);
                    }
                }
                start_write(inner, &mut st);
            }
        }
    }
    done.run();
}

fn rx_cb(inner: &Arc<WsInner>) {
    let mut done = Completions::new();
    {
        let mut st = inner.st.lock();
        match inner.rxaio.result() {
            Err(rv) => {
                // Read errors mean the peer went away abruptly.
                st.rxframe = None;
                ws_fail(inner, &mut st, &mut done, rv);
            }
            Ok(()) => {
                if inner.rxaio.recv_remaining() > 0 {
                    inner.http.recv(&inner.rxaio);
                } else {
                    rx_step(inner, &mut st, &mut done);
                }
            }
        }
    }
    done.run();
}

/// The close aio has settled: either the handshake completed or the drain
/// deadline passed. Tear the connection down.
fn close_cb(inner: &Arc<WsInner>) {
    inner.txaio.close();
    inner.rxaio.close();
    let mut done = Completions::new();
    {
        let mut st = inner.st.lock();
        st.dead = true;
        drain_tx(&mut st, &mut done, &Error::Closed);
        for aio in st.recvq.drain(..) {
            done.add(aio, Err(Error::Closed), 0);
        }
        inner.http.close();
    }
    done.run();
}

impl Stream for WsStream {
    fn send(&self, aio: &Aio) {
        aio.reset();
        let inner = self.inner.clone();
        let mut done = Completions::new();
        {
            let mut st = self.inner.st.lock();
            let started = aio.start(move |a, code| {
                let mut st = inner.st.lock();
                if st
                    .txframe
                    .as_ref()
                    .is_some_and(|f| f.aio.as_ref().is_some_and(|q| q.ptr_eq(a)))
                {
                    // Mid-write; the transmit callback settles it.
                    inner.txaio.abort(code);
                } else if let Some(pos) = st
                    .txq
                    .iter()
                    .position(|f| f.aio.as_ref().is_some_and(|q| q.ptr_eq(a)))
                {
                    st.txq.remove(pos);
                    if let Some(qpos) = st.sendq.iter().position(|q| q.ptr_eq(a)) {
                        st.sendq.remove(qpos);
                    }
                    drop(st);
                    a.finish_error(code);
                }
            });
            if !started {
                return;
            }
            if st.closed || st.dead {
                drop(st);
                aio.finish_error(Error::Closed);
                return;
            }
            st.sendq.push_back(aio.clone());
            let frame = prep_data_frame(&self.inner, aio);
            st.txq.push_back(frame);
            start_write(&self.inner, &mut st);
        }
        done.run();
    }

    fn recv(&self, aio: &Aio) {
        aio.reset();
        let inner = self.inner.clone();
        let mut done = Completions::new();
        {
            let mut st = self.inner.st.lock();
            let started = aio.start(move |a, code| {
                let mut st = inner.st.lock();
                if let Some(pos) = st.recvq.iter().position(|q| q.ptr_eq(a)) {
                    st.recvq.remove(pos);
                    drop(st);
                    a.finish_error(code);
                }
            });
            if !started {
                return;
            }
            if st.dead {
                drop(st);
                aio.finish_error(Error::Closed);
                return;
            }
            if st.closed && st.rxq.is_empty() {
                drop(st);
                aio.finish_error(Error::Closed);
                return;
            }
            st.recvq.push_back(aio.clone());
            read_finish(&self.inner, &mut st, &mut done);
            rx_resume(&self.inner, &mut st, &mut done);
        }
        done.run();
    }

    fn close(&self) {
        let mut done = Completions::new();
        {
            let mut st = self.inner.st.lock();
            ws_close(&self.inner, &mut st, &mut done, close_code::NORMAL);
        }
        done.run();
    }

    fn stop(&self) {
        self.close();
        // Give the close handshake its chance to drain.
        self.inner.closeaio.wait();
        self.inner.rxaio.stop();
        self.inner.txaio.stop();
        self.inner.closeaio.stop();
        self.inner.http.stop();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        if let Some(h) = name.strip_prefix(HEADER_PROP_PREFIX) {
            // Actual values seen on the wire, response first.
            return http::get_header(&self.inner.resp_headers, h)
                .or_else(|| http::get_header(&self.inner.req_headers, h))
                .map(|v| PropValue::Str(v.to_string()))
                .ok_or(Error::NotSup);
        }
        match name {
            props::RECVMAX_FRAME => Ok(PropValue::Size(self.inner.maxframe)),
            props::SENDMAX_FRAME => Ok(PropValue::Size(self.inner.fragsize)),
            hawser_core::stream::props::RECV_MAX => Ok(PropValue::Size(self.inner.recvmax)),
            _ => self.inner.http.get(name),
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.inner.http.set(name, value)
    }
}

// --- upgrade handshake ---------------------------------------------------

/// Exactly-once rendezvous between a user dial/accept aio and the
/// in-flight upgrade it is waiting on.
struct UserSlot {
    user: Option<Aio>,
}

/// Per-connection upgrade driver shared by dialer and listener: reads
/// and writes HTTP heads over the raw stream with one aio.
struct Upgrade {
    stream: Box<dyn Stream>,
    aio: Aio,
    buf: BytesMut,
    req: Option<Request>,
    resp: Option<Response>,
}

enum ServerPhase {
    ReadRequest,
    /// Response on the wire; `accept` carries the upgrade outcome.
    SendResponse {
        accept: bool,
    },
}

struct ServerUpgrade {
    up: Mutex<Option<Upgrade>>,
    phase: Mutex<ServerPhase>,
    listener: Weak<WsListenerInner>,
}

/// Accepts WebSocket connections: an HTTP/1.1 handler bound to one URL
/// path over an inner stream listener.
pub struct WsListener {
    inner: Arc<WsListenerInner>,
}

/// An optional server hook may rewrite the prepared 101 response; any
/// other status short-circuits the upgrade with that answer. There is no
/// dialer-side equivalent.
pub type ListenerHook = Box<dyn Fn(&Request, &mut Response) + Send + Sync>;

struct WsListenerInner {
    tcp: Box<dyn StreamListener>,
    path: String,
    mode: WsMode,
    connaio: Aio,
    st: Mutex<WsListenerState>,
}

struct WsListenerState {
    closed: bool,
    started: bool,
    opts: WsOpts,
    hook: Option<ListenerHook>,
    pend: VecDeque<WsStream>,
    acceptq: VecDeque<Aio>,
    upgrades: Vec<Arc<ServerUpgrade>>,
}

impl WsListener {
    #[must_use]
    pub fn new(tcp: Box<dyn StreamListener>, path: &str, mode: WsMode) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<WsListenerInner>| {
            let w = weak.clone();
            let connaio = Aio::new(move |_| {
                if let Some(l) = w.upgrade() {
                    listener_conn_cb(&l);
                }
            });
            WsListenerInner {
                tcp,
                path: path.to_string(),
                mode,
                connaio,
                st: Mutex::new(WsListenerState {
                    closed: false,
                    started: false,
                    opts: WsOpts::default(),
                    hook: None,
                    pend: VecDeque::new(),
                    acceptq: VecDeque::new(),
                    upgrades: Vec::new(),
                }),
            }
        });
        Self { inner }
    }

    /// Install the HTTP hook. Must precede `listen`.
    pub fn set_hook(&self, hook: ListenerHook) -> Result<()> {
        let mut st = self.inner.st.lock();
        if st.started {
            return Err(Error::Busy);
        }
        st.hook = Some(hook);
        Ok(())
    }
}

impl StreamListener for WsListener {
    fn listen(&self) -> Result<()> {
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                return Err(Error::Closed);
            }
            if st.started {
                return Err(Error::State);
            }
            st.started = true;
        }
        self.inner.tcp.listen()?;
        self.inner.tcp.accept(&self.inner.connaio);
        Ok(())
    }

    fn accept(&self, aio: &Aio) {
        aio.reset();
        let inner = self.inner.clone();
        let mut st = self.inner.st.lock();
        let started = aio.start(move |a, code| {
            let mut st = inner.st.lock();
            if let Some(pos) = st.acceptq.iter().position(|q| q.ptr_eq(a)) {
                st.acceptq.remove(pos);
                drop(st);
                a.finish_error(code);
            }
        });
        if !started {
            return;
        }
        if st.closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        if !st.started {
            drop(st);
            aio.finish_error(Error::State);
            return;
        }
        if let Some(ws) = st.pend.pop_front() {
            drop(st);
            aio.set_output(0, Box::new(Box::new(ws) as Box<dyn Stream>));
            aio.finish(Ok(()), 0);
            return;
        }
        st.acceptq.push_back(aio.clone());
    }

    fn close(&self) {
        let (aios, upgrades, pend) = {
            let mut st = self.inner.st.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            (
                st.acceptq.drain(..).collect::<Vec<_>>(),
                std::mem::take(&mut st.upgrades),
                st.pend.drain(..).collect::<Vec<_>>(),
            )
        };
        self.inner.connaio.close();
        self.inner.tcp.close();
        for up in upgrades {
            up.aio_close();
        }
        for ws in pend {
            Stream::close(&ws);
        }
        for aio in aios {
            aio.finish_error(Error::Closed);
        }
    }

    fn stop(&self) {
        self.close();
        self.inner.connaio.stop();
        self.inner.tcp.stop();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match self.inner.st.lock().opts.get(name) {
            Err(Error::NotSup) => {}
            other => return other,
        }
        self.inner.tcp.get(name)
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        {
            let mut st = self.inner.st.lock();
            if st.started {
                return Err(Error::Busy);
            }
            match st.opts.set(name, &value) {
                Err(Error::NotSup) => {}
                other => return other,
            }
        }
        self.inner.tcp.set(name, value)
    }
}

impl ServerUpgrade {
    fn aio_close(&self) {
        if let Some(u) = self.up.lock().as_ref() {
            u.aio.close();
            u.stream.close();
        }
    }
}

fn listener_conn_cb(inner: &Arc<WsListenerInner>) {
    let aio = &inner.connaio;
    let mut st = inner.st.lock();

    match aio.result() {
        Ok(()) => {
            if let Some(stream) = take_stream_output(aio) {
                if st.closed {
                    drop(st);
                    stream.close();
                    return;
                }
                let upgrade = server_upgrade_start(inner, stream);
                st.upgrades.push(upgrade);
            }
            inner.tcp.accept(aio);
        }
        Err(rv) => {
            if !st.closed && !rv.is_teardown() {
                inner.tcp.accept(aio);
            }
        }
    }
}

fn server_upgrade_start(
    listener: &Arc<WsListenerInner>,
    stream: Box<dyn Stream>,
) -> Arc<ServerUpgrade> {
    let upgrade = Arc::new_cyclic(|weak: &Weak<ServerUpgrade>| {
        let w = weak.clone();
        let aio = Aio::new(move |_| {
            if let Some(u) = w.upgrade() {
                server_upgrade_cb(&u);
            }
        });
        aio.set_timeout(Timeout::After(UPGRADE_TIMEOUT));
        ServerUpgrade {
            up: Mutex::new(Some(Upgrade {
                stream,
                aio,
                buf: BytesMut::new(),
                req: None,
                resp: None,
            })),
            phase: Mutex::new(ServerPhase::ReadRequest),
            listener: Arc::downgrade(listener),
        }
    });

    {
        let up = upgrade.up.lock();
        if let Some(u) = up.as_ref() {
            u.aio.set_recv(HTTP_READ_CHUNK);
            u.stream.recv(&u.aio);
        }
    }
    upgrade
}

fn upgrade_detach(listener: &Arc<WsListenerInner>, me: &Arc<ServerUpgrade>) {
    let mut st = listener.st.lock();
    st.upgrades.retain(|u| !Arc::ptr_eq(u, me));
}

fn server_upgrade_cb(me: &Arc<ServerUpgrade>) {
    let Some(listener) = me.listener.upgrade() else {
        if let Some(u) = me.up.lock().take() {
            u.stream.close();
        }
        return;
    };

    let mut up = me.up.lock();
    let Some(u) = up.as_mut() else { return };

    if u.aio.result().is_err() {
        let u = up.take().unwrap();
        drop(up);
        u.stream.close();
        upgrade_detach(&listener, me);
        return;
    }

    let mut phase = me.phase.lock();
    match *phase {
        ServerPhase::ReadRequest => {
            if let Some(data) = u.aio.take_recv() {
                u.buf.extend_from_slice(&data);
            }
            match Request::parse(&u.buf) {
                Err(_) => {
                    let u = up.take().unwrap();
                    drop(phase);
                    drop(up);
                    u.stream.close();
                    upgrade_detach(&listener, me);
                }
                Ok(None) => {
                    u.aio.set_recv(HTTP_READ_CHUNK);
                    u.stream.recv(&u.aio);
                }
                Ok(Some((req, used))) => {
                    // Anything past the head already belongs to the
                    // websocket layer.
                    u.buf = u.buf.split_off(used);

                    let (resp, accept) = server_answer(&listener, &req);
                    *phase = ServerPhase::SendResponse { accept };
                    u.req = Some(req);
                    let _ = u.aio.set_iov(&[resp.encode()]);
                    u.resp = Some(resp);
                    u.stream.send(&u.aio);
                }
            }
        }
        ServerPhase::SendResponse { accept } => {
            let n = u.aio.count();
            u.aio.iov_advance(n);
            if u.aio.iov_count() > 0 {
                u.stream.send(&u.aio);
                return;
            }
            let u = up.take().unwrap();
            drop(phase);
            drop(up);
            if accept {
                let (opts, mode) = {
                    let st = listener.st.lock();
                    (st.opts.clone(), listener.mode)
                };
                let req_headers = u.req.map(|r| r.headers).unwrap_or_default();
                let resp_headers = u.resp.map(|r| r.headers).unwrap_or_default();
                let ws = WsStream::new(
                    u.stream,
                    true,
                    mode,
                    &opts,
                    u.buf,
                    req_headers,
                    resp_headers,
                );
                deliver_ws(&listener, ws);
            } else {
                u.stream.close();
            }
            upgrade_detach(&listener, me);
        }
    }
}

/// Queue a negotiated websocket for the next accept.
fn deliver_ws(listener: &Arc<WsListenerInner>, ws: WsStream) {
    let mut st = listener.st.lock();
    if st.closed {
        drop(st);
        Stream::close(&ws);
        return;
    }
    if let Some(aio) = st.acceptq.pop_front() {
        drop(st);
        aio.set_output(0, Box::new(Box::new(ws) as Box<dyn Stream>));
        aio.finish(Ok(()), 0);
    } else {
        st.pend.push_back(ws);
    }
}

/// Validate an upgrade request and prepare the answer.
fn server_answer(listener: &Arc<WsListenerInner>, req: &Request) -> (Response, bool) {
    let st = listener.st.lock();

    let reject = |status: u16| (Response::new(status), false);

    if st.closed {
        return reject(http::STATUS_SERVICE_UNAVAILABLE);
    }
    if req.version != "HTTP/1.1" {
        return reject(http::STATUS_VERSION_NOT_SUPP);
    }
    if req.method != "GET" {
        return reject(http::STATUS_BAD_REQUEST);
    }
    if req.uri != listener.path {
        return reject(http::STATUS_NOT_FOUND);
    }
    if req
        .header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|n| n > 0)
        || req
            .header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return reject(http::STATUS_CONTENT_TOO_LARGE);
    }
    if !req.header("Upgrade").is_some_and(|v| http::contains_word(v, "websocket"))
        || !req
            .header("Connection")
            .is_some_and(|v| http::contains_word(v, "upgrade"))
        || req.header("Sec-WebSocket-Version") != Some("13")
    {
        return reject(http::STATUS_BAD_REQUEST);
    }
    let Some(accept_token) = req
        .header("Sec-WebSocket-Key")
        .and_then(|k| make_accept(k).ok())
    else {
        return reject(http::STATUS_BAD_REQUEST);
    };

    // Subprotocol negotiation: the client's offer must be one of our
    // configured words, echoed back verbatim.
    let client_proto = req.header("Sec-WebSocket-Protocol");
    let selected = match (client_proto, st.opts.protocol.as_deref()) {
        (None, None) => None,
        (None, Some(_)) => return reject(http::STATUS_BAD_REQUEST),
        (Some(_), None) => return reject(http::STATUS_BAD_REQUEST),
        (Some(cp), Some(ours)) => {
            if !http::contains_word(ours, cp) {
                return reject(http::STATUS_BAD_REQUEST);
            }
            Some(cp.to_string())
        }
    };

    let mut resp = Response::new(http::STATUS_SWITCHING);
    for (name, value) in &st.opts.headers {
        resp.set_header(name, value);
    }
    resp.set_header("Connection", "Upgrade");
    resp.set_header("Upgrade", "websocket");
    resp.set_header("Sec-WebSocket-Accept", &accept_token);
    if let Some(p) = &selected {
        resp.set_header("Sec-WebSocket-Protocol", p);
    }

    // The hook may rewrite the response wholesale; anything but 101 turns
    // the upgrade down with that answer.
    if let Some(hook) = &st.hook {
        hook(req, &mut resp);
        if resp.status != http::STATUS_SWITCHING {
            return (resp, false);
        }
    }

    (resp, true)
}

enum DialPhase {
    SendRequest,
    ReadResponse,
}

struct DialUpgrade {
    up: Mutex<Option<Upgrade>>,
    phase: Mutex<DialPhase>,
    user: Mutex<UserSlot>,
    key: String,
    dialer: Weak<WsDialerInner>,
}

/// Dials WebSocket connections: connects the inner stream, performs the
/// upgrade request, and validates the response.
pub struct WsDialer {
    inner: Arc<WsDialerInner>,
}

struct WsDialerInner {
    tcp: Box<dyn StreamDialer>,
    host: String,
    path: String,
    mode: WsMode,
    st: Mutex<WsDialerState>,
}

struct WsDialerState {
    closed: bool,
    started: bool,
    opts: WsOpts,
}

impl WsDialer {
    #[must_use]
    pub fn new(tcp: Box<dyn StreamDialer>, host: &str, path: &str, mode: WsMode) -> Self {
        Self {
            inner: Arc::new(WsDialerInner {
                tcp,
                host: host.to_string(),
                path: path.to_string(),
                mode,
                st: Mutex::new(WsDialerState {
                    closed: false,
                    started: false,
                    opts: WsOpts::default(),
                }),
            }),
        }
    }
}

impl StreamDialer for WsDialer {
    fn dial(&self, aio: &Aio) {
        aio.reset();
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                drop(st);
                aio.finish_error(Error::Closed);
                return;
            }
            st.started = true;
        }

        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let key = make_key(nonce);

        let attempt = Arc::new_cyclic(|weak: &Weak<DialUpgrade>| {
            let w = weak.clone();
            let conn_aio = Aio::new(move |a| {
                if let Some(at) = w.upgrade() {
                    dial_upgrade_cb(&at, a);
                }
            });
            conn_aio.set_timeout(Timeout::After(UPGRADE_TIMEOUT));
            DialUpgrade {
                up: Mutex::new(Some(Upgrade {
                    stream: Box::new(NullStream),
                    aio: conn_aio,
                    buf: BytesMut::new(),
                    req: None,
                    resp: None,
                })),
                phase: Mutex::new(DialPhase::SendRequest),
                user: Mutex::new(UserSlot { user: None }),
                key,
                dialer: Arc::downgrade(&self.inner),
            }
        });

        let hook = attempt.clone();
        let started = aio.start(move |a, code| {
            let taken = {
                let mut slot = hook.user.lock();
                slot.user.take().map(|u| {
                    debug_assert!(u.ptr_eq(a));
                })
            };
            if taken.is_some() {
                if let Some(u) = hook.up.lock().take() {
                    u.aio.close();
                    u.stream.close();
                }
                a.finish_error(code);
            }
        });
        if !started {
            return;
        }
        attempt.user.lock().user = Some(aio.clone());

        // The connect itself reuses the upgrade aio.
        let conn_aio = attempt.up.lock().as_ref().map(|u| u.aio.clone());
        if let Some(conn_aio) = conn_aio {
            self.inner.tcp.dial(&conn_aio);
        }
    }

    fn close(&self) {
        self.inner.st.lock().closed = true;
        self.inner.tcp.close();
    }

    fn stop(&self) {
        self.close();
        self.inner.tcp.stop();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match self.inner.st.lock().opts.get(name) {
            Err(Error::NotSup) => {}
            other => return other,
        }
        self.inner.tcp.get(name)
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        {
            let mut st = self.inner.st.lock();
            if st.started {
                return Err(Error::Busy);
            }
            match st.opts.set(name, &value) {
                Err(Error::NotSup) => {}
                other => return other,
            }
        }
        self.inner.tcp.set(name, value)
    }
}

/// Placeholder stream before the connect completes.
struct NullStream;

impl Stream for NullStream {
    fn send(&self, aio: &Aio) {
        aio.reset();
        aio.finish_error(Error::State);
    }
    fn recv(&self, aio: &Aio) {
        aio.reset();
        aio.finish_error(Error::State);
    }
    fn close(&self) {}
    fn stop(&self) {}
}

fn dial_fail(attempt: &Arc<DialUpgrade>, code: Error) {
    let user = attempt.user.lock().user.take();
    if let Some(u) = attempt.up.lock().take() {
        u.stream.close();
    }
    if let Some(user) = user {
        user.finish_error(code);
    }
}

fn dial_upgrade_cb(attempt: &Arc<DialUpgrade>, aio: &Aio) {
    let Some(dialer) = attempt.dialer.upgrade() else {
        dial_fail(attempt, Error::Closed);
        return;
    };

    if let Err(rv) = aio.result() {
        dial_fail(attempt, rv);
        return;
    }

    // First completion is the connect itself.
    if let Some(stream) = take_stream_output(aio) {
        let (proto, headers) = {
            let st = dialer.st.lock();
            (st.opts.protocol.clone(), st.opts.headers.clone())
        };
        let mut req = Request::get(&dialer.path);
        req.set_header("Host", &dialer.host);
        for (name, value) in &headers {
            req.set_header(name, value);
        }
        req.set_header("Upgrade", "websocket");
        req.set_header("Connection", "Upgrade");
        req.set_header("Sec-WebSocket-Key", &attempt.key);
        req.set_header("Sec-WebSocket-Version", "13");
        if let Some(p) = &proto {
            req.set_header("Sec-WebSocket-Protocol", p);
        }

        let mut up = attempt.up.lock();
        if let Some(u) = up.as_mut() {
            u.stream = stream;
            let _ = u.aio.set_iov(&[req.encode()]);
            u.req = Some(req);
            u.stream.send(&u.aio);
        } else {
            // User cancelled while connecting.
            stream.close();
        }
        return;
    }

    let mut phase = attempt.phase.lock();
    let mut up = attempt.up.lock();
    let Some(u) = up.as_mut() else { return };
    match *phase {
        DialPhase::SendRequest => {
            let n = u.aio.count();
            u.aio.iov_advance(n);
            if u.aio.iov_count() > 0 {
                u.stream.send(&u.aio);
                return;
            }
            *phase = DialPhase::ReadResponse;
            u.aio.set_recv(HTTP_READ_CHUNK);
            u.stream.recv(&u.aio);
        }
        DialPhase::ReadResponse => {
            if let Some(data) = u.aio.take_recv() {
                u.buf.extend_from_slice(&data);
            }
            match Response::parse(&u.buf) {
                Err(_) => {
                    drop(up);
                    drop(phase);
                    dial_fail(attempt, Error::Proto);
                }
                Ok(None) => {
                    u.aio.set_recv(HTTP_READ_CHUNK);
                    u.stream.recv(&u.aio);
                }
                Ok(Some((resp, used))) => {
                    let leftover = u.buf.split_off(used);
                    drop(up);
                    drop(phase);
                    dial_validate(attempt, &dialer, resp, leftover);
                }
            }
        }
    }
}

fn dial_validate(
    attempt: &Arc<DialUpgrade>,
    dialer: &Arc<WsDialerInner>,
    resp: Response,
    leftover: BytesMut,
) {
    // Status mapping: auth failures are permission errors, the
    // not-here family reads as refusal, anything else strange is a
    // protocol error.
    let rv = match resp.status {
        http::STATUS_SWITCHING => None,
        401 | 403 => Some(Error::Perm),
        404 | 405 | 501 => Some(Error::ConnRefused),
        _ => Some(Error::Proto),
    };
    if let Some(rv) = rv {
        dial_fail(attempt, rv);
        return;
    }

    let Ok(expect) = make_accept(&attempt.key) else {
        dial_fail(attempt, Error::Proto);
        return;
    };
    let ok = resp.header("Sec-WebSocket-Accept") == Some(expect.as_str())
        && resp
            .header("Connection")
            .is_some_and(|v| http::contains_word(v, "upgrade"))
        && resp.header("Upgrade") == Some("websocket");
    if !ok {
        dial_fail(attempt, Error::Proto);
        return;
    }

    let (opts, proto) = {
        let st = dialer.st.lock();
        (st.opts.clone(), st.opts.protocol.clone())
    };
    if let Some(ours) = &proto {
        let echoed = resp.header("Sec-WebSocket-Protocol");
        if !echoed.is_some_and(|p| http::contains_word(ours, p)) {
            dial_fail(attempt, Error::Proto);
            return;
        }
    }

    let user = attempt.user.lock().user.take();
    let up = attempt.up.lock().take();
    match (user, up) {
        (Some(user), Some(u)) => {
            let req_headers = u.req.map(|r| r.headers).unwrap_or_default();
            let ws = WsStream::new(
                u.stream,
                false,
                dialer.mode,
                &opts,
                leftover,
                req_headers,
                resp.headers.clone(),
            );
            user.set_output(0, Box::new(Box::new(ws) as Box<dyn Stream>));
            user.finish(Ok(()), 0);
        }
        (None, Some(u)) => u.stream.close(),
        _ => {}
    }
}
