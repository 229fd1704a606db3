//! Socket endpoints: dialers and listeners.
//!
//! Each endpoint owns a framed-transport endpoint for one address.
//! Dialers keep one connection up, redialing with a short backoff when it
//! drops; listeners keep a standing accept and admit every negotiated
//! pipe. Admission (peer validation, id assignment, protocol attach)
//! happens in the socket layer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use hawser_core::addr::Addr;
use hawser_core::aio::{sleep_aio, Aio};
use hawser_core::error::{Error, Result};
use hawser_core::stream::PropValue;
use hawser_sp::framed::{SpEndpoint, SpPipe};
use hawser_sp::scheme;
use hawser_sp::tls::TlsConfig;

use crate::socket::{self, SocketInner};

/// Delay before a dialer retries after losing its connection.
const REDIAL_BACKOFF: Duration = Duration::from_millis(100);

static NEXT_EP_ID: AtomicU32 = AtomicU32::new(1);

fn next_ep_id() -> u32 {
    NEXT_EP_ID.fetch_add(1, Ordering::Relaxed)
}

/// A pipe's owning endpoint: a dialer or a listener, never both.
#[derive(Clone)]
pub(crate) enum EpRef {
    Dialer(Weak<DialerInner>),
    Listener(Weak<ListenerInner>),
}

impl EpRef {
    pub(crate) fn get(&self, name: &str) -> Result<PropValue> {
        match self {
            Self::Dialer(w) => w.upgrade().map_or(Err(Error::NotSup), |d| d.ep.get(name)),
            Self::Listener(w) => w.upgrade().map_or(Err(Error::NotSup), |l| l.ep.get(name)),
        }
    }

    pub(crate) fn dialer_id(&self) -> u32 {
        match self {
            Self::Dialer(w) => w.upgrade().map_or(0, |d| d.id),
            Self::Listener(_) => 0,
        }
    }

    pub(crate) fn listener_id(&self) -> u32 {
        match self {
            Self::Listener(w) => w.upgrade().map_or(0, |l| l.id),
            Self::Dialer(_) => 0,
        }
    }
}

/// Keeps one outbound connection to an address.
#[derive(Clone)]
pub struct Dialer {
    pub(crate) inner: Arc<DialerInner>,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer").field("id", &self.inner.id).finish()
    }
}

pub(crate) struct DialerInner {
    pub(crate) id: u32,
    pub(crate) ep: SpEndpoint,
    sock: Weak<SocketInner>,
    pumpaio: Aio,
    retryaio: Aio,
    st: Mutex<DialerState>,
}

struct DialerState {
    closed: bool,
    /// Synchronous dial waiting on the first attempt's outcome.
    waiter: Option<Aio>,
}

impl Dialer {
    pub(crate) fn create(
        sock: &Arc<SocketInner>,
        addr: &Addr,
        tls: Option<Arc<TlsConfig>>,
    ) -> Result<Self> {
        let sd = scheme::dialer_for(addr, tls)?;
        let ep = SpEndpoint::dialer(sd, sock.proto.proto_id());
        ep.set_recvmax(sock.recvmax());

        let sock_weak = Arc::downgrade(sock);
        let inner = Arc::new_cyclic(|weak: &Weak<DialerInner>| {
            let w = weak.clone();
            let pumpaio = Aio::new(move |_| {
                if let Some(d) = w.upgrade() {
                    dial_pump_cb(&d);
                }
            });
            let w = weak.clone();
            let retryaio = Aio::new(move |_| {
                if let Some(d) = w.upgrade() {
                    if d.retryaio.result().is_ok() {
                        d.kick();
                    }
                }
            });
            DialerInner {
                id: next_ep_id(),
                ep,
                sock: sock_weak,
                pumpaio,
                retryaio,
                st: Mutex::new(DialerState {
                    closed: false,
                    waiter: None,
                }),
            }
        });
        Ok(Self { inner })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Start connecting in the background, retrying on failure.
    pub fn start(&self) {
        self.inner.kick();
    }

    /// Start connecting and block until the first attempt resolves.
    pub fn start_sync(&self) -> Result<()> {
        let waiter = Aio::new(|_| {});
        waiter.reset();
        // Started so `wait` blocks until the pump completes it.
        if !waiter.start(|_, _| {}) {
            return Err(Error::Stopped);
        }
        self.inner.st.lock().waiter = Some(waiter.clone());
        self.inner.kick();
        waiter.wait();
        waiter.result()
    }

    pub fn get(&self, name: &str) -> Result<PropValue> {
        self.inner.ep.get(name)
    }

    pub fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.inner.ep.set(name, value)
    }

    pub fn close(&self) {
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        self.inner.retryaio.close();
        self.inner.ep.close();
    }
}

impl DialerInner {
    fn kick(self: &Arc<Self>) {
        if self.st.lock().closed {
            return;
        }
        self.ep.connect(&self.pumpaio);
    }
}

/// A dropped dialer pipe schedules a redial after a short cooldown.
pub(crate) fn schedule_redial(inner: &Arc<DialerInner>) {
    if inner.st.lock().closed {
        return;
    }
    sleep_aio(REDIAL_BACKOFF, &inner.retryaio);
}

fn dial_pump_cb(inner: &Arc<DialerInner>) {
    let outcome = match inner.pumpaio.result() {
        Ok(()) => match inner.pumpaio.take_output_as::<SpPipe>(0) {
            Some(sp) => match inner.sock.upgrade() {
                Some(sock) => {
                    socket::add_pipe(&sock, sp, EpRef::Dialer(Arc::downgrade(inner))).map(|_| ())
                }
                None => Err(Error::Closed),
            },
            None => Err(Error::NoMem),
        },
        Err(rv) => Err(rv),
    };

    let (waiter, closed) = {
        let mut st = inner.st.lock();
        (st.waiter.take(), st.closed)
    };

    if let Err(rv) = &outcome {
        // A background dialer keeps trying; a watched first attempt
        // reports its failure and stops.
        if waiter.is_none() && !closed && !rv.is_teardown() {
            schedule_redial(inner);
        }
    }

    if let Some(waiter) = waiter {
        match outcome {
            Ok(()) => waiter.finish(Ok(()), 0),
            Err(rv) => waiter.finish_error(rv),
        }
    }
}

/// Accepts inbound connections on an address.
#[derive(Clone)]
pub struct Listener {
    pub(crate) inner: Arc<ListenerInner>,
}

pub(crate) struct ListenerInner {
    pub(crate) id: u32,
    pub(crate) ep: SpEndpoint,
    sock: Weak<SocketInner>,
    pumpaio: Aio,
    st: Mutex<ListenerState>,
}

struct ListenerState {
    closed: bool,
}

impl Listener {
    pub(crate) fn create(
        sock: &Arc<SocketInner>,
        addr: &Addr,
        tls: Option<Arc<TlsConfig>>,
    ) -> Result<Self> {
        let sl = scheme::listener_for(addr, tls)?;
        let ep = SpEndpoint::listener(sl, sock.proto.proto_id());
        ep.set_recvmax(sock.recvmax());

        let sock_weak = Arc::downgrade(sock);
        let inner = Arc::new_cyclic(|weak: &Weak<ListenerInner>| {
            let w = weak.clone();
            let pumpaio = Aio::new(move |_| {
                if let Some(l) = w.upgrade() {
                    listen_pump_cb(&l);
                }
            });
            ListenerInner {
                id: next_ep_id(),
                ep,
                sock: sock_weak,
                pumpaio,
                st: Mutex::new(ListenerState { closed: false }),
            }
        });
        Ok(Self { inner })
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Bind and start admitting connections.
    pub fn start(&self) -> Result<()> {
        self.inner.ep.listen()?;
        self.inner.ep.accept(&self.inner.pumpaio);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<PropValue> {
        self.inner.ep.get(name)
    }

    pub fn set(&self, name: &str, value: PropValue) -> Result<()> {
        self.inner.ep.set(name, value)
    }

    pub fn close(&self) {
        {
            let mut st = self.inner.st.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        self.inner.ep.close();
    }
}

fn listen_pump_cb(inner: &Arc<ListenerInner>) {
    match inner.pumpaio.result() {
        Ok(()) => {
            if let Some(sp) = inner.pumpaio.take_output_as::<SpPipe>(0) {
                if let Some(sock) = inner.sock.upgrade() {
                    // Rejected pipes are closed inside; the accept loop
                    // carries on either way.
                    let _ = socket::add_pipe(
                        &sock,
                        sp,
                        EpRef::Listener(Arc::downgrade(inner)),
                    );
                } else {
                    sp.close();
                    return;
                }
            }
        }
        Err(rv) => {
            if rv.is_teardown() || inner.st.lock().closed {
                return;
            }
        }
    }
    inner.ep.accept(&inner.pumpaio);
}
