//! Shared connection pump for platform streams.
//!
//! One reader thread and one writer thread per connection. Each direction
//! waits on a condition variable for queued AIOs, performs the blocking
//! call, and completes the head AIO. Cancellation of a queued AIO unlinks
//! it; cancellation of the in-flight receive diverts arriving bytes into a
//! stash that the next receive consumes, so partial data never leaks
//! across operations and never disappears. Closing shuts the socket down,
//! which wakes any blocked call.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};

use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::stream::{props, PropValue, Stream};

/// Largest single blocking read issued by the pump.
const RX_CHUNK: usize = 64 * 1024;

/// Blocking duplex I/O endpoint: `read`/`write` by shared reference, plus
/// a shutdown that wakes both.
pub(crate) trait Io: Send + Sync + 'static {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn shutdown(&self);
    fn local_addr(&self) -> Option<String>;
    fn peer_addr(&self) -> Option<String>;
    fn get_prop(&self, name: &str) -> Result<PropValue> {
        let _ = name;
        Err(Error::NotSup)
    }
    fn set_prop(&self, name: &str, value: &PropValue) -> Result<()> {
        let _ = (name, value);
        Err(Error::NotSup)
    }
}

pub(crate) struct Conn<I: Io> {
    inner: Arc<ConnInner<I>>,
}

struct ConnInner<I> {
    io: I,
    st: Mutex<ConnState>,
    rx_cv: Condvar,
    tx_cv: Condvar,
}

struct ConnState {
    closed: bool,
    sendq: VecDeque<Aio>,
    recvq: VecDeque<Aio>,
    /// Bytes read for a receive that was cancelled mid-flight.
    stash: BytesMut,
    rx_active: Option<Aio>,
    rx_abandoned: bool,
    /// Terminal read-side condition (EOF or error); served after stash.
    rx_broken: Option<Error>,
    tx_broken: Option<Error>,
    rx_done: bool,
    tx_done: bool,
}

impl<I: Io> Conn<I> {
    pub(crate) fn new(io: I) -> Self {
        let inner = Arc::new(ConnInner {
            io,
            st: Mutex::new(ConnState {
                closed: false,
                sendq: VecDeque::new(),
                recvq: VecDeque::new(),
                stash: BytesMut::new(),
                rx_active: None,
                rx_abandoned: false,
                rx_broken: None,
                tx_broken: None,
                rx_done: false,
                tx_done: false,
            }),
            rx_cv: Condvar::new(),
            tx_cv: Condvar::new(),
        });

        let rx = inner.clone();
        thread::Builder::new()
            .name("hawser:conn:rx".to_string())
            .spawn(move || rx_pump(&rx))
            .expect("spawn conn reader");
        let tx = inner.clone();
        thread::Builder::new()
            .name("hawser:conn:tx".to_string())
            .spawn(move || tx_pump(&tx))
            .expect("spawn conn writer");

        Self { inner }
    }
}

fn rx_pump<I: Io>(inner: &Arc<ConnInner<I>>) {
    let mut st = inner.st.lock();
    loop {
        if st.closed {
            let q: Vec<Aio> = st.recvq.drain(..).collect();
            st.rx_done = true;
            drop(st);
            inner.rx_cv.notify_all();
            for aio in q {
                aio.finish_error(Error::Closed);
            }
            return;
        }

        // Serve buffered bytes before touching the socket again.
        if !st.stash.is_empty() {
            if let Some(aio) = st.recvq.pop_front() {
                let want = aio.recv_remaining();
                if want == 0 {
                    drop(st);
                    aio.finish_error(Error::Inval);
                } else {
                    let n = want.min(st.stash.len());
                    let chunk = st.stash.split_to(n);
                    drop(st);
                    aio.recv_append(&chunk);
                    aio.finish(Ok(()), n);
                }
                st = inner.st.lock();
                continue;
            }
        } else if let Some(code) = st.rx_broken.clone() {
            if let Some(aio) = st.recvq.pop_front() {
                drop(st);
                aio.finish_error(code);
                st = inner.st.lock();
                continue;
            }
        }

        let Some(aio) = st.recvq.pop_front() else {
            inner.rx_cv.wait(&mut st);
            continue;
        };
        let want = aio.recv_remaining();
        if want == 0 {
            drop(st);
            aio.finish_error(Error::Inval);
            st = inner.st.lock();
            continue;
        }
        st.rx_active = Some(aio);
        st.rx_abandoned = false;
        drop(st);

        let mut buf = vec![0u8; want.min(RX_CHUNK)];
        let res = inner.io.read(&mut buf);

        st = inner.st.lock();
        let active = st.rx_active.take();
        let abandoned = std::mem::take(&mut st.rx_abandoned);
        match res {
            Ok(0) => {
                // Local close and peer EOF both land here; report them
                // distinctly.
                let code = if st.closed { Error::Closed } else { Error::ConnShut };
                st.rx_broken = Some(code.clone());
                if let Some(aio) = active {
                    if !abandoned {
                        drop(st);
                        aio.finish_error(code);
                        st = inner.st.lock();
                    }
                }
            }
            Ok(n) => {
                if let Some(aio) = active {
                    debug_assert!(!abandoned);
                    drop(st);
                    aio.recv_append(&buf[..n]);
                    aio.finish(Ok(()), n);
                    st = inner.st.lock();
                } else {
                    // Cancelled while blocked; keep the bytes for the next
                    // receive.
                    st.stash.extend_from_slice(&buf[..n]);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                if let Some(aio) = active {
                    if !abandoned {
                        st.recvq.push_front(aio);
                    }
                }
            }
            Err(e) => {
                let code = if st.closed { Error::Closed } else { Error::from(e) };
                st.rx_broken = Some(code.clone());
                if let Some(aio) = active {
                    if !abandoned {
                        drop(st);
                        aio.finish_error(code);
                        st = inner.st.lock();
                    }
                }
            }
        }
    }
}

fn tx_pump<I: Io>(inner: &Arc<ConnInner<I>>) {
    let mut st = inner.st.lock();
    loop {
        if st.closed {
            let q: Vec<Aio> = st.sendq.drain(..).collect();
            st.tx_done = true;
            drop(st);
            // Stop waiters poll both flags on rx_cv.
            inner.rx_cv.notify_all();
            for aio in q {
                aio.finish_error(Error::Closed);
            }
            return;
        }
        if let Some(code) = st.tx_broken.clone() {
            if let Some(aio) = st.sendq.pop_front() {
                drop(st);
                aio.finish_error(code);
                st = inner.st.lock();
                continue;
            }
        }
        let Some(aio) = st.sendq.pop_front() else {
            inner.tx_cv.wait(&mut st);
            continue;
        };
        drop(st);

        let segs = aio.iov();
        let mut total = 0usize;
        let mut failure: Option<Error> = None;
        'segs: for seg in &segs {
            let mut off = 0;
            while off < seg.len() {
                match inner.io.write(&seg[off..]) {
                    Ok(0) => {
                        failure = Some(Error::ConnShut);
                        break 'segs;
                    }
                    Ok(n) => {
                        off += n;
                        total += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        failure = Some(e.into());
                        break 'segs;
                    }
                }
            }
        }

        st = inner.st.lock();
        match failure {
            None => {
                drop(st);
                aio.finish(Ok(()), total);
            }
            Some(code) => {
                let code = if st.closed { Error::Closed } else { code };
                st.tx_broken = Some(code.clone());
                drop(st);
                aio.finish_error(code);
            }
        }
        st = inner.st.lock();
    }
}

impl<I: Io> Stream for Conn<I> {
    fn send(&self, aio: &Aio) {
        aio.reset();
        let inner = self.inner.clone();
        // The queue lock is held across start so the cancel hook cannot
        // run before the aio is actually queued.
        let mut st = self.inner.st.lock();
        let started = aio.start(move |a, code| {
            // Only queued sends can be withdrawn; an in-flight write runs
            // to completion and finishes normally.
            let found = {
                let mut st = inner.st.lock();
                match st.sendq.iter().position(|q| q.ptr_eq(a)) {
                    Some(pos) => {
                        st.sendq.remove(pos);
                        true
                    }
                    None => false,
                }
            };
            if found {
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
        st.sendq.push_back(aio.clone());
        drop(st);
        self.inner.tx_cv.notify_all();
    }

    fn recv(&self, aio: &Aio) {
        aio.reset();
        let inner = self.inner.clone();
        let mut st = self.inner.st.lock();
        let started = aio.start(move |a, code| {
            let found = {
                let mut st = inner.st.lock();
                if let Some(pos) = st.recvq.iter().position(|q| q.ptr_eq(a)) {
                    st.recvq.remove(pos);
                    true
                } else if st.rx_active.as_ref().is_some_and(|q| q.ptr_eq(a)) {
                    st.rx_active = None;
                    st.rx_abandoned = true;
                    true
                } else {
                    false
                }
            };
            if found {
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
        st.recvq.push_back(aio.clone());
        drop(st);
        self.inner.rx_cv.notify_all();
    }

    fn close(&self) {
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        self.inner.io.shutdown();
        self.inner.rx_cv.notify_all();
        self.inner.tx_cv.notify_all();
    }

    fn stop(&self) {
        self.close();
        let mut st = self.inner.st.lock();
        while !(st.rx_done && st.tx_done) {
            self.inner.rx_cv.wait(&mut st);
        }
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            props::LOCAL_ADDR => self
                .inner
                .io
                .local_addr()
                .map(PropValue::Str)
                .ok_or(Error::NotSup),
            props::REMOTE_ADDR => self
                .inner
                .io
                .peer_addr()
                .map(PropValue::Str)
                .ok_or(Error::NotSup),
            _ => self.inner.io.get_prop(name),
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.inner.io.set_prop(name, &value)
    }
}

impl<I: Io> Drop for Conn<I> {
    fn drop(&mut self) {
        // The pump threads hold their own Arc; make sure they can exit.
        Stream::close(self);
    }
}
