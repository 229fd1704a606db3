//! TLS stream adapter.
//!
//! Engine-agnostic: the record-layer buffering, queueing, and lifecycle
//! live here, while the actual TLS computation is delegated to a pluggable
//! [`engine::TlsEngine`] registered process-wide. No cryptographic engine
//! is bundled.

pub mod config;
pub mod engine;
pub mod stream;

pub use config::{TlsAuthMode, TlsConfig, TlsMode, TlsVersion};
pub use engine::{set_engine, EngineIo, TlsEngine, TlsEngineConn};
pub use stream::{TlsDialer, TlsListener};
