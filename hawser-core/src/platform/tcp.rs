//! TCP streams, dialers, and listeners.

use std::net::{self, SocketAddr};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use super::conn::{Conn, Io};
use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::stream::{props, PropValue, Stream, StreamDialer, StreamListener};

struct TcpIo(net::TcpStream);

impl Io for TcpIo {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::io::Read;
        (&self.0).read(buf)
    }

    fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        use std::io::Write;
        (&self.0).write(buf)
    }

    fn shutdown(&self) {
        let _ = self.0.shutdown(net::Shutdown::Both);
    }

    fn local_addr(&self) -> Option<String> {
        self.0.local_addr().ok().map(|a| a.to_string())
    }

    fn peer_addr(&self) -> Option<String> {
        self.0.peer_addr().ok().map(|a| a.to_string())
    }

    fn get_prop(&self, name: &str) -> Result<PropValue> {
        match name {
            props::TCP_NODELAY => Ok(PropValue::Bool(self.0.nodelay().unwrap_or(false))),
            _ => Err(Error::NotSup),
        }
    }

    fn set_prop(&self, name: &str, value: &PropValue) -> Result<()> {
        match name {
            props::TCP_NODELAY => {
                self.0.set_nodelay(value.as_bool()?).map_err(Error::from)
            }
            _ => Err(Error::NotSup),
        }
    }
}

fn wrap_stream(stream: net::TcpStream, nodelay: bool) -> Box<dyn Stream> {
    if nodelay {
        let _ = stream.set_nodelay(true);
    }
    Box::new(Conn::new(TcpIo(stream)))
}

/// Dials TCP connections. Each dial attempt runs on its own thread; a
/// cancelled attempt discards the socket when the connect returns.
pub struct TcpDialer {
    inner: Arc<DialerInner>,
}

struct DialerInner {
    addr: SocketAddr,
    st: Mutex<DialerState>,
}

struct DialerState {
    closed: bool,
    nodelay: bool,
}

impl TcpDialer {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(DialerInner {
                addr,
                st: Mutex::new(DialerState {
                    closed: false,
                    nodelay: true,
                }),
            }),
        }
    }
}

impl StreamDialer for TcpDialer {
    fn dial(&self, aio: &Aio) {
        aio.reset();

        // Whoever takes the aio out of the slot finishes it: cancel,
        // connect success, or connect failure.
        let slot = Arc::new(Mutex::new(None::<Aio>));
        let hook_slot = slot.clone();
        let started = aio.start(move |_a, code| {
            if let Some(aio) = hook_slot.lock().take() {
                aio.finish_error(code);
            }
        });
        if !started {
            return;
        }
        *slot.lock() = Some(aio.clone());

        {
            let st = self.inner.st.lock();
            if st.closed {
                if let Some(aio) = slot.lock().take() {
                    aio.finish_error(Error::Closed);
                }
                return;
            }
        }

        let inner = self.inner.clone();
        thread::Builder::new()
            .name("hawser:tcp:dial".to_string())
            .spawn(move || {
                let res = net::TcpStream::connect(inner.addr);
                let nodelay = inner.st.lock().nodelay;
                match res {
                    Ok(stream) => {
                        if let Some(aio) = slot.lock().take() {
                            aio.set_output(0, Box::new(wrap_stream(stream, nodelay)));
                            aio.finish(Ok(()), 0);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(addr = %inner.addr, error = %e, "tcp connect failed");
                        if let Some(aio) = slot.lock().take() {
                            aio.finish_error(e.into());
                        }
                    }
                }
            })
            .expect("spawn tcp dial");
    }

    fn close(&self) {
        self.inner.st.lock().closed = true;
    }

    fn stop(&self) {
        self.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            props::TCP_NODELAY => Ok(PropValue::Bool(self.inner.st.lock().nodelay)),
            props::REMOTE_ADDR => Ok(PropValue::Str(self.inner.addr.to_string())),
            _ => Err(Error::NotSup),
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        match name {
            props::TCP_NODELAY => {
                self.inner.st.lock().nodelay = value.as_bool()?;
                Ok(())
            }
            _ => Err(Error::NotSup),
        }
    }
}

/// Accepts TCP connections on a dedicated thread.
pub struct TcpListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    addr: SocketAddr,
    st: Mutex<ListenerState>,
    cv: Condvar,
}

struct ListenerState {
    sock: Option<Arc<net::TcpListener>>,
    acceptq: std::collections::VecDeque<Aio>,
    active: Option<Aio>,
    closed: bool,
    done: bool,
    bound_port: u16,
    nodelay: bool,
}

impl TcpListener {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                addr,
                st: Mutex::new(ListenerState {
                    sock: None,
                    acceptq: std::collections::VecDeque::new(),
                    active: None,
                    closed: false,
                    done: false,
                    bound_port: 0,
                    nodelay: true,
                }),
                cv: Condvar::new(),
            }),
        }
    }
}

fn accept_pump(inner: &Arc<ListenerInner>, sock: &Arc<net::TcpListener>) {
    let mut st = inner.st.lock();
    loop {
        if st.closed {
            let q: Vec<Aio> = st.acceptq.drain(..).collect();
            st.done = true;
            drop(st);
            inner.cv.notify_all();
            for aio in q {
                aio.finish_error(Error::Closed);
            }
            return;
        }
        let Some(aio) = st.acceptq.pop_front() else {
            inner.cv.wait(&mut st);
            continue;
        };
        st.active = Some(aio);
        drop(st);

        let res = sock.accept();

        st = inner.st.lock();
        let active = st.active.take();
        match res {
            Ok((stream, _peer)) => {
                let nodelay = st.nodelay;
                if st.closed {
                    drop(st);
                    if let Some(aio) = active {
                        aio.finish_error(Error::Closed);
                    }
                    st = inner.st.lock();
                } else if let Some(aio) = active {
                    drop(st);
                    aio.set_output(0, Box::new(wrap_stream(stream, nodelay)));
                    aio.finish(Ok(()), 0);
                    st = inner.st.lock();
                }
                // No waiter (cancelled mid-accept): the connection is
                // discarded.
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                if let Some(aio) = active {
                    st.acceptq.push_front(aio);
                }
            }
            Err(e) => {
                if !st.closed {
                    tracing::debug!(addr = %inner.addr, error = %e, "tcp accept failed");
                }
                let code = if st.closed { Error::Closed } else { e.into() };
                drop(st);
                if let Some(aio) = active {
                    aio.finish_error(code);
                }
                st = inner.st.lock();
            }
        }
    }
}

impl StreamListener for TcpListener {
    fn listen(&self) -> Result<()> {
        let mut st = self.inner.st.lock();
        if st.closed {
            return Err(Error::Closed);
        }
        if st.sock.is_some() {
            return Err(Error::State);
        }
        let sock = Arc::new(net::TcpListener::bind(self.inner.addr)?);
        st.bound_port = sock.local_addr().map(|a| a.port()).unwrap_or(0);
        st.sock = Some(sock.clone());
        drop(st);

        let inner = self.inner.clone();
        thread::Builder::new()
            .name("hawser:tcp:accept".to_string())
            .spawn(move || accept_pump(&inner, &sock))
            .expect("spawn tcp accept");
        Ok(())
    }

    fn accept(&self, aio: &Aio) {
        aio.reset();
        let inner = self.inner.clone();
        let mut st = self.inner.st.lock();
        let started = aio.start(move |a, code| {
            let found = {
                let mut st = inner.st.lock();
                if let Some(pos) = st.acceptq.iter().position(|q| q.ptr_eq(a)) {
                    st.acceptq.remove(pos);
                    true
                } else if st.active.as_ref().is_some_and(|q| q.ptr_eq(a)) {
                    st.active = None;
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
        if st.sock.is_none() {
            drop(st);
            aio.finish_error(Error::State);
            return;
        }
        st.acceptq.push_back(aio.clone());
        drop(st);
        self.inner.cv.notify_all();
    }

    fn close(&self) {
        let sock = {
            let mut st = self.inner.st.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.sock.clone()
        };
        if let Some(sock) = sock {
            // Wake the blocking accept.
            let _ = socket2::SockRef::from(sock.as_ref()).shutdown(net::Shutdown::Both);
        }
        self.inner.cv.notify_all();
    }

    fn stop(&self) {
        self.close();
        let mut st = self.inner.st.lock();
        // Only meaningful once the pump exists.
        while st.sock.is_some() && !st.done {
            self.inner.cv.wait(&mut st);
        }
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        let st = self.inner.st.lock();
        match name {
            props::TCP_BOUND_PORT => Ok(PropValue::Int(i64::from(st.bound_port))),
            props::TCP_NODELAY => Ok(PropValue::Bool(st.nodelay)),
            props::LOCAL_ADDR => Ok(PropValue::Str(self.inner.addr.to_string())),
            _ => Err(Error::NotSup),
        }
    }

    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        match name {
            props::TCP_NODELAY => {
                self.inner.st.lock().nodelay = value.as_bool()?;
                Ok(())
            }
            _ => Err(Error::NotSup),
        }
    }
}
