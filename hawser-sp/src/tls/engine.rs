//! TLS engine traits and the process-wide engine slot.
//!
//! An engine supplies the cryptography; the adapter supplies buffered
//! transport. Engines move ciphertext exclusively through the
//! [`EngineIo`] view handed into every call, which fronts the adapter's
//! record buffers.

use std::sync::Arc;

use once_cell::sync::OnceCell;

use hawser_core::error::{Error, Result};

use super::config::TlsConfig;

/// Ciphertext channel between an engine and the adapter's buffers.
///
/// Both directions use `Err(Again)` for flow control: the send side when
/// the outbound ring is full, the receive side when no ciphertext is
/// buffered (which also arms a read on the underlying stream).
pub trait EngineIo {
    /// Push TLS record output toward the wire. Returns bytes accepted.
    fn put_ciphertext(&mut self, buf: &[u8]) -> Result<usize>;
    /// Pull received ciphertext. Returns bytes copied out.
    fn get_ciphertext(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Per-connection engine state machine.
pub trait TlsEngineConn: Send {
    /// Drive the handshake. `Ok` when established, `Err(Again)` while in
    /// progress, any other error is fatal to the connection.
    fn handshake(&mut self, io: &mut dyn EngineIo) -> Result<()>;

    /// Encrypt and emit plaintext. Returns bytes consumed; `Err(Again)`
    /// when the outbound path is full.
    fn send(&mut self, buf: &[u8], io: &mut dyn EngineIo) -> Result<usize>;

    /// Decrypt into `buf`. Returns bytes produced; `Err(Again)` when more
    /// ciphertext is needed.
    fn recv(&mut self, buf: &mut [u8], io: &mut dyn EngineIo) -> Result<usize>;

    /// True once the peer presented a certificate that verified.
    fn verified(&self) -> bool;

    /// Common name of the peer certificate, when there is one.
    fn peer_cn(&self) -> Option<String>;
}

/// Engine factory. One engine serves the whole process.
pub trait TlsEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn new_conn(&self, cfg: &TlsConfig) -> Result<Box<dyn TlsEngineConn>>;
}

static ENGINE: OnceCell<Arc<dyn TlsEngine>> = OnceCell::new();

/// Register the process TLS engine. May be called once.
pub fn set_engine(engine: Arc<dyn TlsEngine>) -> Result<()> {
    ENGINE.set(engine).map_err(|_| Error::Busy)
}

/// The registered engine, or `NotSup` when TLS is unavailable.
pub fn engine() -> Result<Arc<dyn TlsEngine>> {
    ENGINE.get().cloned().ok_or(Error::NotSup)
}
