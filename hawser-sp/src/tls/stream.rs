//! The TLS connection: a byte stream over a byte stream.
//!
//! Ciphertext moves through two fixed record-sized buffers: a circular
//! send ring the engine fills and the underlying writer drains, and a
//! receive buffer the underlying reader fills and the engine drains. Two
//! internal AIOs drive the underlying stream; user sends and receives
//! queue here and are pumped whenever buffer state changes. Every pump
//! drives the handshake to completion first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use hawser_core::aio::{Aio, Completions};
use hawser_core::error::{Error, Result};
use hawser_core::stream::{
    props, take_stream_output, PropValue, Stream, StreamDialer, StreamListener,
};

use super::config::TlsConfig;
use super::engine::{self, EngineIo, TlsEngineConn};

/// Send ring capacity, aligned to the maximum TLS record size.
const TLS_MAX_SEND: usize = 16 * 1024;
/// Receive staging capacity.
const TLS_MAX_RECV: usize = 16 * 1024;

/// Record buffers shared with the engine through [`EngineIo`].
struct Buffers {
    ring: Box<[u8]>,
    head: usize,
    tail: usize,
    len: usize,
    recv: BytesMut,
    want_read: bool,
    closed: bool,
}

impl Buffers {
    fn new() -> Self {
        Self {
            ring: vec![0u8; TLS_MAX_SEND].into_boxed_slice(),
            head: 0,
            tail: 0,
            len: 0,
            recv: BytesMut::new(),
            want_read: false,
            closed: false,
        }
    }

    /// Unsent ring contents as at most two copied segments.
    fn pending_segments(&self) -> SmallVec<[Bytes; 2]> {
        let mut segs = SmallVec::new();
        let mut len = self.len;
        let mut tail = self.tail;
        while len > 0 {
            let cnt = if tail < self.head {
                self.head - tail
            } else {
                TLS_MAX_SEND - tail
            }
            .min(len);
            segs.push(Bytes::copy_from_slice(&self.ring[tail..tail + cnt]));
            len -= cnt;
            tail = (tail + cnt) % TLS_MAX_SEND;
        }
        segs
    }

    /// Retire `n` bytes the underlying stream confirmed sent.
    fn consume_sent(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.len -= n;
        self.tail = (self.tail + n) % TLS_MAX_SEND;
    }
}

impl EngineIo for Buffers {
    fn put_ciphertext(&mut self, buf: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::Closed);
        }
        let space = TLS_MAX_SEND - self.len;
        if space == 0 {
            return Err(Error::Again);
        }
        let mut len = buf.len().min(space);
        let accepted = len;
        let mut src = buf;
        self.len += len;
        while len > 0 {
            let cnt = if self.head >= self.tail {
                TLS_MAX_SEND - self.head
            } else {
                self.tail - self.head
            }
            .min(len);
            self.ring[self.head..self.head + cnt].copy_from_slice(&src[..cnt]);
            src = &src[cnt..];
            self.head = (self.head + cnt) % TLS_MAX_SEND;
            len -= cnt;
        }
        Ok(accepted)
    }

    fn get_ciphertext(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.recv.is_empty() {
            self.want_read = true;
            return Err(Error::Again);
        }
        let n = buf.len().min(self.recv.len());
        buf[..n].copy_from_slice(&self.recv[..n]);
        let _ = self.recv.split_to(n);
        Ok(n)
    }
}

struct TlsState {
    engine: Box<dyn TlsEngineConn>,
    bufs: Buffers,
    hs_done: bool,
    failed: Option<Error>,
    sendq: VecDeque<Aio>,
    recvq: VecDeque<Aio>,
    tx_active: bool,
    rx_pend: bool,
}

/// A TLS-protected byte stream.
pub struct TlsStream {
    inner: Arc<TlsInner>,
}

struct TlsInner {
    tcp: Box<dyn Stream>,
    st: Mutex<TlsState>,
    txaio: Aio,
    rxaio: Aio,
    did_close: AtomicBool,
}

impl TlsStream {
    /// Wrap `tcp` with TLS using the process engine and `cfg`. The config
    /// freezes on this call.
    pub fn start(tcp: Box<dyn Stream>, cfg: &Arc<TlsConfig>) -> Result<Self> {
        let eng = engine::engine()?;
        let conn = eng.new_conn(cfg)?;
        cfg.mark_busy();

        let inner = Arc::new_cyclic(|weak: &Weak<TlsInner>| {
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
            TlsInner {
                tcp,
                st: Mutex::new(TlsState {
                    engine: conn,
                    bufs: Buffers::new(),
                    hs_done: false,
                    failed: None,
                    sendq: VecDeque::new(),
                    recvq: VecDeque::new(),
                    tx_active: false,
                    rx_pend: false,
                }),
                txaio,
                rxaio,
                did_close: AtomicBool::new(false),
            }
        });

        // Kick the handshake: clients emit their hello, servers arm a
        // read.
        let mut done = Completions::new();
        {
            let mut st = inner.st.lock();
            pump(&inner, &mut st, &mut done);
        }
        done.run();

        Ok(Self { inner })
    }
}

/// Fail the connection: everything queued completes with `code` and the
/// underlying stream closes. Fatal engine or transport errors land here.
fn fail(
    inner: &Arc<TlsInner>,
    st: &mut MutexGuard<'_, TlsState>,
    done: &mut Completions,
    code: Error,
) {
    if st.failed.is_some() {
        return;
    }
    st.failed = Some(code.clone());
    st.bufs.closed = true;
    for aio in st.sendq.drain(..) {
        done.add(aio, Err(code.clone()), 0);
    }
    for aio in st.recvq.drain(..) {
        done.add(aio, Err(code.clone()), 0);
    }
    inner.txaio.close();
    inner.rxaio.close();
    inner.tcp.close();
}

/// Drive handshake then data in both directions against the queues.
fn pump(inner: &Arc<TlsInner>, st: &mut MutexGuard<'_, TlsState>, done: &mut Completions) {
    if st.failed.is_none() && !st.hs_done {
        let state = &mut **st;
        match state.engine.handshake(&mut state.bufs) {
            Ok(()) => st.hs_done = true,
            Err(Error::Again) => {}
            Err(e) => fail(inner, st, done, e),
        }
    }

    if st.failed.is_none() && st.hs_done {
        do_send(inner, st, done);
        do_recv(inner, st, done);
    }

    kick_io(inner, st);
}

fn do_send(inner: &Arc<TlsInner>, st: &mut MutexGuard<'_, TlsState>, done: &mut Completions) {
    loop {
        let Some(aio) = st.sendq.front().cloned() else {
            return;
        };
        let segs = aio.iov();
        let Some(seg) = segs.iter().find(|s| !s.is_empty()) else {
            // Nothing left to write; preserve the accumulated count.
            st.sendq.pop_front();
            let count = aio.count();
            done.add(aio, Ok(()), count);
            continue;
        };
        let state = &mut **st;
        match state.engine.send(seg, &mut state.bufs) {
            Ok(n) => {
                // One segment (possibly partial) per completion; the
                // caller advances and resubmits.
                st.sendq.pop_front();
                done.add(aio, Ok(()), n);
            }
            Err(Error::Again) => return,
            Err(e) => {
                fail(inner, st, done, e);
                return;
            }
        }
    }
}

fn do_recv(inner: &Arc<TlsInner>, st: &mut MutexGuard<'_, TlsState>, done: &mut Completions) {
    loop {
        let Some(aio) = st.recvq.front().cloned() else {
            return;
        };
        let want = aio.recv_remaining();
        if want == 0 {
            st.recvq.pop_front();
            done.add(aio, Err(Error::Inval), 0);
            continue;
        }
        let mut tmp = vec![0u8; want.min(TLS_MAX_RECV)];
        let state = &mut **st;
        match state.engine.recv(&mut tmp, &mut state.bufs) {
            Ok(n) => {
                // Return as soon as there is any data.
                aio.recv_append(&tmp[..n]);
                st.recvq.pop_front();
                done.add(aio, Ok(()), n);
            }
            Err(Error::Again) => return,
            Err(e) => {
                fail(inner, st, done, e);
                return;
            }
        }
    }
}

/// Start underlying transfers to match buffer state.
fn kick_io(inner: &Arc<TlsInner>, st: &mut MutexGuard<'_, TlsState>) {
    if st.failed.is_none() && st.bufs.len > 0 && !st.tx_active {
        let segs = st.bufs.pending_segments();
        if inner.txaio.set_iov(&segs).is_ok() {
            st.tx_active = true;
            inner.tcp.send(&inner.txaio);
        }
    }
    if st.failed.is_none() && st.bufs.want_read && st.bufs.recv.is_empty() && !st.rx_pend {
        st.bufs.want_read = false;
        st.rx_pend = true;
        inner.rxaio.set_recv(TLS_MAX_RECV);
        inner.tcp.recv(&inner.rxaio);
    }
}

fn tx_cb(inner: &Arc<TlsInner>) {
    let mut done = Completions::new();
    {
        let mut st = inner.st.lock();
        st.tx_active = false;
        match inner.txaio.result() {
            Err(rv) => fail(inner, &mut st, &mut done, rv),
            Ok(()) => {
                let n = inner.txaio.count();
                st.bufs.consume_sent(n);
                pump(inner, &mut st, &mut done);
            }
        }
    }
    done.run();
}

fn rx_cb(inner: &Arc<TlsInner>) {
    let mut done = Completions::new();
    {
        let mut st = inner.st.lock();
        st.rx_pend = false;
        match inner.rxaio.result() {
            Err(rv) => fail(inner, &mut st, &mut done, rv),
            Ok(()) => {
                let got = inner.rxaio.take_recv().unwrap_or_default();
                debug_assert!(st.bufs.recv.is_empty());
                st.bufs.recv = got;
                pump(inner, &mut st, &mut done);
            }
        }
    }
    done.run();
}

impl Stream for TlsStream {
    fn send(&self, aio: &Aio) {
        aio.reset();
        let inner = self.inner.clone();
        let mut done = Completions::new();
        {
            let mut st = self.inner.st.lock();
            let started = aio.start(move |a, code| {
                // Withdrawing the in-flight head is fatal to the
                // connection, as the record may be half-written.
                let mut st = inner.st.lock();
                if st.sendq.front().is_some_and(|q| q.ptr_eq(a)) {
                    inner.txaio.abort(code);
                } else if let Some(pos) = st.sendq.iter().position(|q| q.ptr_eq(a)) {
                    st.sendq.remove(pos);
                    drop(st);
                    a.finish_error(code);
                }
            });
            if !started {
                return;
            }
            if let Some(code) = st.failed.clone() {
                drop(st);
                aio.finish_error(code);
                return;
            }
            st.sendq.push_back(aio.clone());
            pump(&self.inner, &mut st, &mut done);
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
                if st.recvq.front().is_some_and(|q| q.ptr_eq(a)) {
                    inner.rxaio.abort(code);
                } else if let Some(pos) = st.recvq.iter().position(|q| q.ptr_eq(a)) {
                    st.recvq.remove(pos);
                    drop(st);
                    a.finish_error(code);
                }
            });
            if !started {
                return;
            }
            if let Some(code) = st.failed.clone() {
                drop(st);
                aio.finish_error(code);
                return;
            }
            st.recvq.push_back(aio.clone());
            pump(&self.inner, &mut st, &mut done);
        }
        done.run();
    }

    fn close(&self) {
        if self.inner.did_close.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut done = Completions::new();
        {
            let mut st = self.inner.st.lock();
            fail(&self.inner, &mut st, &mut done, Error::Closed);
        }
        done.run();
    }

    fn stop(&self) {
        self.close();
        self.inner.txaio.stop();
        self.inner.rxaio.stop();
        self.inner.tcp.stop();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match self.inner.tcp.get(name) {
            Err(Error::NotSup) => {}
            other => return other,
        }
        let st = self.inner.st.lock();
        match name {
            props::TLS_VERIFIED => Ok(PropValue::Bool(st.engine.verified())),
            props::TLS_PEER_CN => st
                .engine
                .peer_cn()
                .map(PropValue::Str)
                .ok_or(Error::NotSup),
            _ => Err(Error::NotSup),
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.inner.tcp.set(name, value)
    }
}

/// Exactly-once rendezvous for an in-flight dial or accept: whoever takes
/// the pending entry completes the user aio.
struct Pending {
    user: Option<Aio>,
    conn: Option<Aio>,
}

fn start_conn(
    cfg: Arc<TlsConfig>,
    user: &Aio,
    submit: impl FnOnce(&Aio),
) {
    let pending = Arc::new(Mutex::new(Pending {
        user: None,
        conn: None,
    }));

    let p = pending.clone();
    let conn_aio = Aio::new(move |a| {
        let user = {
            let mut pd = p.lock();
            pd.conn = None;
            pd.user.take()
        };
        let Some(user) = user else { return };
        match a.result() {
            Ok(()) => match take_stream_output(a) {
                Some(tcp) => match TlsStream::start(tcp, &cfg) {
                    Ok(tls) => {
                        user.set_output(0, Box::new(Box::new(tls) as Box<dyn Stream>));
                        user.finish(Ok(()), 0);
                    }
                    Err(e) => user.finish_error(e),
                },
                None => user.finish_error(Error::NoMem),
            },
            Err(e) => user.finish_error(e),
        }
    });

    let hook = pending.clone();
    let started = user.start(move |_a, code| {
        // Pass cancellation down; the conn aio's completion delivers the
        // final result exactly once.
        let conn = hook.lock().conn.clone();
        if let Some(conn) = conn {
            conn.abort(code);
        }
    });
    if !started {
        return;
    }
    {
        let mut pd = pending.lock();
        pd.user = Some(user.clone());
        pd.conn = Some(conn_aio.clone());
    }
    submit(&conn_aio);
}

/// Dials a TLS connection over an inner stream dialer.
pub struct TlsDialer {
    tcp: Box<dyn StreamDialer>,
    st: Mutex<(Arc<TlsConfig>, bool)>,
}

impl TlsDialer {
    #[must_use]
    pub fn new(tcp: Box<dyn StreamDialer>, cfg: Arc<TlsConfig>) -> Self {
        Self {
            tcp,
            st: Mutex::new((cfg, false)),
        }
    }

    /// Replace the config; refused once dialing has begun.
    pub fn set_config(&self, cfg: Arc<TlsConfig>) -> Result<()> {
        let mut st = self.st.lock();
        if st.1 {
            return Err(Error::Busy);
        }
        st.0 = cfg;
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> Arc<TlsConfig> {
        self.st.lock().0.clone()
    }
}

impl StreamDialer for TlsDialer {
    fn dial(&self, aio: &Aio) {
        aio.reset();
        let cfg = {
            let mut st = self.st.lock();
            st.1 = true;
            st.0.clone()
        };
        start_conn(cfg, aio, |conn_aio| self.tcp.dial(conn_aio));
    }

    fn close(&self) {
        self.tcp.close();
    }

    fn stop(&self) {
        self.tcp.stop();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        self.tcp.get(name)
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.tcp.set(name, value)
    }
}

/// Accepts TLS connections over an inner stream listener.
pub struct TlsListener {
    tcp: Box<dyn StreamListener>,
    st: Mutex<(Arc<TlsConfig>, bool)>,
}

impl TlsListener {
    #[must_use]
    pub fn new(tcp: Box<dyn StreamListener>, cfg: Arc<TlsConfig>) -> Self {
        Self {
            tcp,
            st: Mutex::new((cfg, false)),
        }
    }

    pub fn set_config(&self, cfg: Arc<TlsConfig>) -> Result<()> {
        let mut st = self.st.lock();
        if st.1 {
            return Err(Error::Busy);
        }
        st.0 = cfg;
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> Arc<TlsConfig> {
        self.st.lock().0.clone()
    }
}

impl StreamListener for TlsListener {
    fn listen(&self) -> Result<()> {
        self.st.lock().1 = true;
        self.tcp.listen()
    }

    fn accept(&self, aio: &Aio) {
        aio.reset();
        let cfg = self.st.lock().0.clone();
        start_conn(cfg, aio, |conn_aio| self.tcp.accept(conn_aio));
    }

    fn close(&self) {
        self.tcp.close();
    }

    fn stop(&self) {
        self.tcp.stop();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        self.tcp.get(name)
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.tcp.set(name, value)
    }
}
