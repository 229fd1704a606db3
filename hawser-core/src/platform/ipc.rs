//! IPC (Unix domain socket) streams, dialers, and listeners.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use super::conn::{Conn, Io};
use crate::aio::Aio;
use crate::error::{Error, Result};
use crate::stream::{props, PropValue, Stream, StreamDialer, StreamListener};

struct IpcIo(UnixStream);

impl Io for IpcIo {
    fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::io::Read;
        (&self.0).read(buf)
    }

    fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        use std::io::Write;
        (&self.0).write(buf)
    }

    fn shutdown(&self) {
        let _ = self.0.shutdown(std::net::Shutdown::Both);
    }

    fn local_addr(&self) -> Option<String> {
        self.0
            .local_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
    }

    fn peer_addr(&self) -> Option<String> {
        self.0
            .peer_addr()
            .ok()
            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
    }
}

fn wrap_stream(stream: UnixStream) -> Box<dyn Stream> {
    Box::new(Conn::new(IpcIo(stream)))
}

/// Dials IPC connections.
pub struct IpcDialer {
    inner: Arc<DialerInner>,
}

struct DialerInner {
    path: PathBuf,
    closed: Mutex<bool>,
}

impl IpcDialer {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(DialerInner {
                path,
                closed: Mutex::new(false),
            }),
        }
    }
}

impl StreamDialer for IpcDialer {
    fn dial(&self, aio: &Aio) {
        aio.reset();
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

        if *self.inner.closed.lock() {
            if let Some(aio) = slot.lock().take() {
                aio.finish_error(Error::Closed);
            }
            return;
        }

        let inner = self.inner.clone();
        thread::Builder::new()
            .name("hawser:ipc:dial".to_string())
            .spawn(move || match UnixStream::connect(&inner.path) {
                Ok(stream) => {
                    if let Some(aio) = slot.lock().take() {
                        aio.set_output(0, Box::new(wrap_stream(stream)));
                        aio.finish(Ok(()), 0);
                    }
                }
                Err(e) => {
                    if let Some(aio) = slot.lock().take() {
                        aio.finish_error(e.into());
                    }
                }
            })
            .expect("spawn ipc dial");
    }

    fn close(&self) {
        *self.inner.closed.lock() = true;
    }

    fn stop(&self) {
        self.close();
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            props::REMOTE_ADDR => Ok(PropValue::Str(self.inner.path.display().to_string())),
            _ => Err(Error::NotSup),
        }
    }
}

/// Accepts IPC connections on a dedicated thread. The socket file is
/// removed when the listener closes.
pub struct IpcListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    path: PathBuf,
    st: Mutex<ListenerState>,
    cv: Condvar,
}

struct ListenerState {
    sock: Option<Arc<UnixListener>>,
    acceptq: std::collections::VecDeque<Aio>,
    active: Option<Aio>,
    closed: bool,
    done: bool,
}

impl IpcListener {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                path,
                st: Mutex::new(ListenerState {
                    sock: None,
                    acceptq: std::collections::VecDeque::new(),
                    active: None,
                    closed: false,
                    done: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }
}

fn accept_pump(inner: &Arc<ListenerInner>, sock: &Arc<UnixListener>) {
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
            Ok((stream, _)) => {
                if st.closed {
                    drop(st);
                    if let Some(aio) = active {
                        aio.finish_error(Error::Closed);
                    }
                    st = inner.st.lock();
                } else if let Some(aio) = active {
                    drop(st);
                    aio.set_output(0, Box::new(wrap_stream(stream)));
                    aio.finish(Ok(()), 0);
                    st = inner.st.lock();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                if let Some(aio) = active {
                    st.acceptq.push_front(aio);
                }
            }
            Err(e) => {
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

impl StreamListener for IpcListener {
    fn listen(&self) -> Result<()> {
        let mut st = self.inner.st.lock();
        if st.closed {
            return Err(Error::Closed);
        }
        if st.sock.is_some() {
            return Err(Error::State);
        }
        // A stale socket file from a dead process would fail the bind.
        let _ = std::fs::remove_file(&self.inner.path);
        let sock = Arc::new(UnixListener::bind(&self.inner.path)?);
        st.sock = Some(sock.clone());
        drop(st);

        let inner = self.inner.clone();
        thread::Builder::new()
            .name("hawser:ipc:accept".to_string())
            .spawn(move || accept_pump(&inner, &sock))
            .expect("spawn ipc accept");
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
            let _ = socket2::SockRef::from(sock.as_ref()).shutdown(std::net::Shutdown::Both);
            let _ = std::fs::remove_file(&self.inner.path);
        }
        self.inner.cv.notify_all();
    }

    fn stop(&self) {
        self.close();
        let mut st = self.inner.st.lock();
        while st.sock.is_some() && !st.done {
            self.inner.cv.wait(&mut st);
        }
    }

    fn get(&self, name: &str) -> Result<PropValue> {
        match name {
            props::LOCAL_ADDR => Ok(PropValue::Str(self.inner.path.display().to_string())),
            _ => Err(Error::NotSup),
        }
    }
}
