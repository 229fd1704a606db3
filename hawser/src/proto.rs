//! The protocol operations table.
//!
//! Messaging patterns plug into sockets through this trait. The socket
//! owns one protocol instance and forwards user sends and receives to it;
//! the protocol owns the per-pipe scheduling (fan-out, queueing, ordering)
//! and drives pipes through their transport operations.

use crate::pipe::Pipe;
use hawser_core::aio::Aio;

pub trait Protocol: Send + Sync {
    /// Our 16-bit protocol identity, sent in the negotiation header.
    fn proto_id(&self) -> u16;

    /// The peer identity we admit; anything else is rejected at
    /// admission.
    fn peer_id(&self) -> u16;

    fn name(&self) -> &'static str;

    fn peer_name(&self) -> &'static str;

    /// A validated pipe has joined the socket; start per-pipe machinery.
    fn pipe_attach(&self, pipe: &Pipe);

    /// The pipe is leaving the socket (close/reap path); tear down
    /// per-pipe machinery. Idempotent.
    fn pipe_detach(&self, pipe: &Pipe);

    /// User send; the message travels in the AIO.
    fn send(&self, aio: &Aio);

    /// User receive; a message arrives in the AIO.
    fn recv(&self, aio: &Aio);

    /// The owning socket is closing.
    fn close(&self);
}
