//! Sockets: protocol-bearing endpoint groups.
//!
//! A socket owns one protocol instance, any number of dialers and
//! listeners, and the pipes they admit. Admission verifies the negotiated
//! peer protocol id; mismatches bump a reject counter and close the pipe.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use hawser_core::addr::Addr;
use hawser_core::aio::{Aio, Timeout};
use hawser_core::error::{Error, Result};
use hawser_core::msg::Msg;
use hawser_sp::framed::SpPipe;
use hawser_sp::tls::TlsConfig;

use crate::endpoint::{Dialer, EpRef, Listener};
use crate::pipe::Pipe;
use crate::proto::Protocol;

/// Default cap on a single inbound message: 0, unlimited.
const DEF_RECVMAX: usize = 0;

pub(crate) struct SocketInner {
    pub(crate) proto: Box<dyn Protocol>,
    st: Mutex<SockState>,
    opts: Mutex<SockOpts>,
    closed: AtomicBool,
    rejects: AtomicU64,
}

struct SockState {
    pipes: Vec<Pipe>,
    dialers: Vec<Dialer>,
    listeners: Vec<Listener>,
}

struct SockOpts {
    recvmax: usize,
    recv_timeout: Timeout,
    send_timeout: Timeout,
}

impl SocketInner {
    pub(crate) fn recvmax(&self) -> usize {
        self.opts.lock().recvmax
    }
}

/// Admit a freshly negotiated transport pipe to the socket.
pub(crate) fn add_pipe(sock: &Arc<SocketInner>, sp: SpPipe, ep: EpRef) -> Result<Pipe> {
    if sock.closed.load(Ordering::Acquire) {
        sp.close();
        return Err(Error::Closed);
    }
    let peer = sp.peer();
    let expect = sock.proto.peer_id();
    if peer != expect {
        sock.rejects.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(peer, expect, "rejecting pipe with wrong peer protocol");
        sp.close();
        return Err(Error::Proto);
    }

    let pipe = Pipe::new(sp, Arc::downgrade(sock), ep);
    sock.st.lock().pipes.push(pipe.clone());
    sock.proto.pipe_attach(&pipe);
    Ok(pipe)
}

/// Final detach, run by the reaper after transport teardown. A dialer
/// losing its pipe schedules a redial.
pub(crate) fn detach_pipe(sock: &Arc<SocketInner>, pipe: &Pipe) {
    {
        let mut st = sock.st.lock();
        if let Some(pos) = st.pipes.iter().position(|p| p.ptr_eq(pipe)) {
            st.pipes.remove(pos);
        }
    }
    if sock.closed.load(Ordering::Acquire) {
        return;
    }
    if let EpRef::Dialer(w) = pipe.ep_ref() {
        if let Some(d) = w.upgrade() {
            crate::endpoint::schedule_redial(&d);
        }
    }
}

/// A messaging socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    /// Open a socket around a protocol instance. Pattern modules provide
    /// wrappers (`bus::open`).
    #[must_use]
    pub fn new(proto: Box<dyn Protocol>) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                proto,
                st: Mutex::new(SockState {
                    pipes: Vec::new(),
                    dialers: Vec::new(),
                    listeners: Vec::new(),
                }),
                opts: Mutex::new(SockOpts {
                    recvmax: DEF_RECVMAX,
                    recv_timeout: Timeout::Infinite,
                    send_timeout: Timeout::Infinite,
                }),
                closed: AtomicBool::new(false),
                rejects: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn proto_id(&self) -> u16 {
        self.inner.proto.proto_id()
    }

    #[must_use]
    pub fn peer_id(&self) -> u16 {
        self.inner.proto.peer_id()
    }

    #[must_use]
    pub fn proto_name(&self) -> &'static str {
        self.inner.proto.name()
    }

    #[must_use]
    pub fn peer_name(&self) -> &'static str {
        self.inner.proto.peer_name()
    }

    /// Cap on a single inbound message; 0 is unlimited. Applies to
    /// endpoints created afterwards.
    pub fn set_recvmax(&self, recvmax: usize) {
        self.inner.opts.lock().recvmax = recvmax;
    }

    #[must_use]
    pub fn recvmax(&self) -> usize {
        self.inner.recvmax()
    }

    pub fn set_recv_timeout(&self, timeout: Timeout) {
        self.inner.opts.lock().recv_timeout = timeout;
    }

    pub fn set_send_timeout(&self, timeout: Timeout) {
        self.inner.opts.lock().send_timeout = timeout;
    }

    /// Bind a listener on `addr` and start admitting connections.
    pub fn listen(&self, addr: &str) -> Result<Listener> {
        self.listen_tls(addr, None)
    }

    pub fn listen_tls(&self, addr: &str, tls: Option<Arc<TlsConfig>>) -> Result<Listener> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let addr = Addr::parse(addr)?;
        let listener = Listener::create(&self.inner, &addr, tls)?;
        listener.start()?;
        self.inner.st.lock().listeners.push(listener.clone());
        Ok(listener)
    }

    /// Connect to `addr`, blocking until the first attempt resolves. The
    /// dialer then keeps the connection alive in the background.
    pub fn dial(&self, addr: &str) -> Result<Dialer> {
        self.dial_impl(addr, None, true)
    }

    /// Connect to `addr` without waiting; failures retry quietly.
    pub fn dial_nb(&self, addr: &str) -> Result<Dialer> {
        self.dial_impl(addr, None, false)
    }

    pub fn dial_tls(&self, addr: &str, tls: Option<Arc<TlsConfig>>) -> Result<Dialer> {
        self.dial_impl(addr, tls, true)
    }

    fn dial_impl(
        &self,
        addr: &str,
        tls: Option<Arc<TlsConfig>>,
        sync: bool,
    ) -> Result<Dialer> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let addr = Addr::parse(addr)?;
        let dialer = Dialer::create(&self.inner, &addr, tls)?;
        if sync {
            if let Err(e) = dialer.start_sync() {
                dialer.close();
                return Err(e);
            }
        } else {
            dialer.start();
        }
        self.inner.st.lock().dialers.push(dialer.clone());
        Ok(dialer)
    }

    /// Submit an asynchronous send; the message travels in the AIO.
    pub fn send_aio(&self, aio: &Aio) {
        aio.normalize_timeout(self.inner.opts.lock().send_timeout);
        if self.inner.closed.load(Ordering::Acquire) {
            aio.reset();
            aio.finish_error(Error::Closed);
            return;
        }
        self.inner.proto.send(aio);
    }

    /// Submit an asynchronous receive.
    pub fn recv_aio(&self, aio: &Aio) {
        aio.normalize_timeout(self.inner.opts.lock().recv_timeout);
        if self.inner.closed.load(Ordering::Acquire) {
            aio.reset();
            aio.finish_error(Error::Closed);
            return;
        }
        self.inner.proto.recv(aio);
    }

    /// Synchronous send honoring the socket send timeout.
    pub fn send_msg(&self, msg: Msg) -> Result<()> {
        let aio = Aio::new(|_| {});
        aio.set_timeout(Timeout::Default);
        aio.set_msg(msg);
        self.send_aio(&aio);
        aio.wait();
        aio.result()
    }

    /// Synchronous receive honoring the socket receive timeout.
    pub fn recv_msg(&self) -> Result<Msg> {
        let aio = Aio::new(|_| {});
        aio.set_timeout(Timeout::Default);
        self.recv_aio(&aio);
        aio.wait();
        aio.result()?;
        aio.take_msg().ok_or(Error::Proto)
    }

    /// Synchronous receive with an explicit deadline.
    pub fn recv_msg_timeout(&self, timeout: Duration) -> Result<Msg> {
        let aio = Aio::new(|_| {});
        aio.set_timeout(Timeout::After(timeout));
        self.recv_aio(&aio);
        aio.wait();
        aio.result()?;
        aio.take_msg().ok_or(Error::Proto)
    }

    #[must_use]
    pub fn pipe_count(&self) -> usize {
        self.inner.st.lock().pipes.len()
    }

    /// Ids of the currently admitted pipes.
    #[must_use]
    pub fn pipe_ids(&self) -> Vec<u32> {
        self.inner.st.lock().pipes.iter().map(Pipe::id).collect()
    }

    /// Pipes rejected at admission for peer-protocol mismatch.
    #[must_use]
    pub fn reject_count(&self) -> u64 {
        self.inner.rejects.load(Ordering::Relaxed)
    }

    /// Close the socket: endpoints, pipes, then the protocol. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let (pipes, dialers, listeners) = {
            let mut st = self.inner.st.lock();
            (
                std::mem::take(&mut st.pipes),
                std::mem::take(&mut st.dialers),
                std::mem::take(&mut st.listeners),
            )
        };
        for d in dialers {
            d.close();
        }
        for l in listeners {
            l.close();
        }
        for p in pipes {
            p.close();
        }
        self.inner.proto.close();
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        self.proto.close();
    }
}
