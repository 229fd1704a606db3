//! Pipes: reference-counted per-connection objects.
//!
//! A pipe binds a negotiated framed-transport connection to a socket and
//! its protocol. Ids come from a global randomized map and stay findable
//! until the reaper runs final teardown, so late property reads against a
//! closing pipe keep working (the operations themselves fail `Closed`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;

use hawser_core::aio::Aio;
use hawser_core::error::{Error, Result};
use hawser_core::reap::reap;
use hawser_core::stream::PropValue;
use hawser_sp::framed::SpPipe;

use crate::endpoint::EpRef;
use crate::socket::{self, SocketInner};

/// The global pipe id map. Guarded by its own mutex, acquired briefly,
/// and never held across any other lock.
static PIPES: Lazy<Mutex<HashMap<u32, Pipe>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// A connection between two peers, admitted to a socket.
///
/// Cheap to clone; the socket holds one reference, the id map another,
/// and transport callbacks hold their own while in flight.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

struct PipeInner {
    id: u32,
    sp: SpPipe,
    sock: Weak<SocketInner>,
    ep: EpRef,
    closed: AtomicBool,
}

impl Pipe {
    pub(crate) fn new(sp: SpPipe, sock: Weak<SocketInner>, ep: EpRef) -> Self {
        let mut map = PIPES.lock();
        let mut rng = rand::thread_rng();
        let id = loop {
            let id: u32 = rng.gen_range(1..=0x7fff_ffff);
            if !map.contains_key(&id) {
                break id;
            }
        };
        let pipe = Self {
            inner: Arc::new(PipeInner {
                id,
                sp,
                sock,
                ep,
                closed: AtomicBool::new(false),
            }),
        };
        map.insert(id, pipe.clone());
        pipe
    }

    /// Look a pipe up by id, acquiring a reference. Pipes remain findable
    /// between close and reap; their operations fail `Closed`.
    pub fn find(id: u32) -> Result<Self> {
        PIPES.lock().get(&id).cloned().ok_or(Error::NoEnt)
    }

    /// Non-zero 32-bit identity, unique while the pipe is alive.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Peer protocol id captured during negotiation.
    #[must_use]
    pub fn peer(&self) -> u16 {
        self.inner.sp.peer()
    }

    /// Id of the owning dialer, or 0 for listener pipes.
    #[must_use]
    pub fn dialer_id(&self) -> u32 {
        self.inner.ep.dialer_id()
    }

    /// Id of the owning listener, or 0 for dialer pipes.
    #[must_use]
    pub fn listener_id(&self) -> u32 {
        self.inner.ep.listener_id()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn ep_ref(&self) -> &EpRef {
        &self.inner.ep
    }

    /// Forward a message send to the transport.
    pub fn send(&self, aio: &Aio) {
        if self.is_closed() {
            aio.reset();
            aio.finish_error(Error::Closed);
            return;
        }
        self.inner.sp.send(aio);
    }

    /// Forward a message receive to the transport.
    pub fn recv(&self, aio: &Aio) {
        if self.is_closed() {
            aio.reset();
            aio.finish_error(Error::Closed);
            return;
        }
        self.inner.sp.recv(aio);
    }

    /// Close the pipe. Idempotent and atomic: the first caller schedules
    /// the reaper, which runs final teardown with no locks held.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let p = self.clone();
        reap(move || {
            let sock = p.inner.sock.upgrade();
            if let Some(sock) = &sock {
                sock.proto.pipe_detach(&p);
            }
            p.inner.sp.close();
            PIPES.lock().remove(&p.inner.id);
            p.inner.sp.stop();
            if let Some(sock) = &sock {
                socket::detach_pipe(sock, &p);
            }
        });
    }

    /// Property chain: transport first, then the owning endpoint.
    pub fn get(&self, name: &str) -> Result<PropValue> {
        match self.inner.sp.get(name) {
            Err(Error::NotSup) => {}
            other => return other,
        }
        self.inner.ep.get(name)
    }

    /// (rx msgs, rx bytes, tx msgs, tx bytes)
    #[must_use]
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        self.inner.sp.stats()
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_unknown_id() {
        assert!(matches!(Pipe::find(0xdead_0000), Err(Error::NoEnt)));
    }
}
