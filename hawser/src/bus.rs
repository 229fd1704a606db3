//! The BUS pattern.
//!
//! Every socket is a peer: a sent message goes to every connected pipe
//! (best effort; a backlogged pipe drops its copy), and receives deliver
//! messages from any pipe in arrival order. A socket never sees its own
//! sends.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use hawser_core::aio::Aio;
use hawser_core::error::Error;
use hawser_core::msg::Msg;

use crate::pipe::Pipe;
use crate::proto::Protocol;
use crate::socket::Socket;

/// BUS protocol identity; peers are BUS as well.
pub const PROTO_ID: u16 = 0x70;

/// Buffered inbound messages before pipes stop reading.
const RX_CAP: usize = 128;
/// Outbound backlog per pipe before copies are dropped.
const TX_CAP: usize = 16;

/// Open a BUS socket.
#[must_use]
pub fn open() -> Socket {
    Socket::new(Box::new(Bus {
        shared: Arc::new(BusShared {
            st: Mutex::new(BusState {
                pipes: Vec::new(),
                rxq: VecDeque::new(),
                recvq: VecDeque::new(),
                closed: false,
            }),
        }),
    }))
}

struct BusShared {
    st: Mutex<BusState>,
}

struct BusState {
    pipes: Vec<BusPipe>,
    /// Arrived messages awaiting receivers, in arrival order.
    rxq: VecDeque<Msg>,
    /// Receivers awaiting messages, in submission order.
    recvq: VecDeque<Aio>,
    closed: bool,
}

struct Bus {
    shared: Arc<BusShared>,
}

#[derive(Clone)]
struct BusPipe {
    inner: Arc<BusPipeInner>,
}

struct BusPipeInner {
    pipe: Pipe,
    shared: Weak<BusShared>,
    st: Mutex<BusPipeState>,
    rxaio: Aio,
    txaio: Aio,
}

struct BusPipeState {
    sendq: VecDeque<Msg>,
    sending: bool,
    paused: bool,
    closed: bool,
}

impl BusPipe {
    fn new(pipe: Pipe, shared: Weak<BusShared>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<BusPipeInner>| {
            let w = weak.clone();
            let rxaio = Aio::new(move |_| {
                if let Some(bp) = w.upgrade() {
                    rx_cb(&bp);
                }
            });
            let w = weak.clone();
            let txaio = Aio::new(move |_| {
                if let Some(bp) = w.upgrade() {
                    tx_cb(&bp);
                }
            });
            BusPipeInner {
                pipe,
                shared,
                st: Mutex::new(BusPipeState {
                    sendq: VecDeque::new(),
                    sending: false,
                    paused: false,
                    closed: false,
                }),
                rxaio,
                txaio,
            }
        });
        Self { inner }
    }

    /// Queue one fan-out copy; a backlogged pipe drops it.
    fn queue(&self, msg: Msg) {
        let inner = &self.inner;
        let mut st = inner.st.lock();
        if st.closed {
            return;
        }
        if st.sending {
            if st.sendq.len() >= TX_CAP {
                tracing::trace!(pipe = inner.pipe.id(), "bus: dropping copy for backlogged pipe");
                return;
            }
            st.sendq.push_back(msg);
        } else {
            st.sending = true;
            drop(st);
            inner.txaio.set_msg(msg);
            inner.pipe.send(&inner.txaio);
        }
    }

    fn shutdown(&self) {
        self.inner.st.lock().closed = true;
        self.inner.rxaio.stop();
        self.inner.txaio.stop();
    }
}

fn rx_cb(inner: &Arc<BusPipeInner>) {
    if inner.rxaio.result().is_err() {
        // The transport noticed a broken pipe; take it out of service.
        inner.pipe.close();
        return;
    }
    let Some(msg) = inner.rxaio.take_msg() else {
        inner.pipe.recv(&inner.rxaio);
        return;
    };
    let Some(shared) = inner.shared.upgrade() else {
        return;
    };

    let waiter = {
        let mut st = shared.st.lock();
        if st.closed {
            return;
        }
        match st.recvq.pop_front() {
            Some(aio) => Some((aio, msg)),
            None => {
                st.rxq.push_back(msg);
                None
            }
        }
    };
    if let Some((aio, msg)) = waiter {
        aio.finish_msg(msg);
    }

    // Stop reading while the socket buffer is full; a receive resumes us.
    let resume = shared.st.lock().rxq.len() < RX_CAP;
    if resume {
        inner.pipe.recv(&inner.rxaio);
    } else {
        inner.st.lock().paused = true;
    }
}

fn tx_cb(inner: &Arc<BusPipeInner>) {
    if inner.txaio.result().is_err() {
        inner.pipe.close();
        return;
    }
    let next = {
        let mut st = inner.st.lock();
        if st.closed {
            return;
        }
        match st.sendq.pop_front() {
            Some(msg) => Some(msg),
            None => {
                st.sending = false;
                None
            }
        }
    };
    if let Some(msg) = next {
        inner.txaio.set_msg(msg);
        inner.pipe.send(&inner.txaio);
    }
}

/// Restart reading on pipes that paused for backpressure.
fn resume_paused(shared: &Arc<BusShared>) {
    let paused: Vec<BusPipe> = {
        let st = shared.st.lock();
        st.pipes
            .iter()
            .filter(|bp| bp.inner.st.lock().paused)
            .cloned()
            .collect()
    };
    for bp in paused {
        let mut st = bp.inner.st.lock();
        if st.paused && !st.closed {
            st.paused = false;
            drop(st);
            bp.inner.pipe.recv(&bp.inner.rxaio);
        }
    }
}

impl Protocol for Bus {
    fn proto_id(&self) -> u16 {
        PROTO_ID
    }

    fn peer_id(&self) -> u16 {
        PROTO_ID
    }

    fn name(&self) -> &'static str {
        "bus"
    }

    fn peer_name(&self) -> &'static str {
        "bus"
    }

    fn pipe_attach(&self, pipe: &Pipe) {
        let bp = BusPipe::new(pipe.clone(), Arc::downgrade(&self.shared));
        {
            let mut st = self.shared.st.lock();
            if st.closed {
                return;
            }
            st.pipes.push(bp.clone());
        }
        bp.inner.pipe.recv(&bp.inner.rxaio);
    }

    fn pipe_detach(&self, pipe: &Pipe) {
        let bp = {
            let mut st = self.shared.st.lock();
            st.pipes
                .iter()
                .position(|bp| bp.inner.pipe.ptr_eq(pipe))
                .map(|pos| st.pipes.remove(pos))
        };
        if let Some(bp) = bp {
            bp.shutdown();
        }
    }

    fn send(&self, aio: &Aio) {
        aio.reset();
        let Some(msg) = aio.take_msg() else {
            aio.finish_error(Error::Inval);
            return;
        };
        let (pipes, closed) = {
            let st = self.shared.st.lock();
            (st.pipes.clone(), st.closed)
        };
        if closed {
            return aio.finish_error(Error::Closed);
        }

        let len = msg.len();
        for bp in &pipes {
            bp.queue(msg.clone());
        }
        // Fan-out is fire-and-forget; the send itself always succeeds.
        aio.finish(Ok(()), len);
    }

    fn recv(&self, aio: &Aio) {
        aio.reset();
        let shared = self.shared.clone();
        let mut st = self.shared.st.lock();
        if st.closed {
            drop(st);
            aio.finish_error(Error::Closed);
            return;
        }
        let hook = self.shared.clone();
        let started = aio.start(move |a, code| {
            let found = {
                let mut st = hook.st.lock();
                match st.recvq.iter().position(|q| q.ptr_eq(a)) {
                    Some(pos) => {
                        st.recvq.remove(pos);
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
        if let Some(msg) = st.rxq.pop_front() {
            drop(st);
            resume_paused(&shared);
            aio.finish_msg(msg);
            return;
        }
        st.recvq.push_back(aio.clone());
    }

    fn close(&self) {
        let waiters = {
            let mut st = self.shared.st.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.rxq.clear();
            st.recvq.drain(..).collect::<Vec<_>>()
        };
        for aio in waiters {
            aio.finish_error(Error::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let s = open();
        assert_eq!(s.proto_id(), 0x70);
        assert_eq!(s.peer_id(), 0x70);
        assert_eq!(s.proto_name(), "bus");
        assert_eq!(s.peer_name(), "bus");
        s.close();
    }
}
