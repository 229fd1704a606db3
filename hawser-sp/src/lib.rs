//! Hawser SP
//!
//! Scalability-protocols plumbing over byte streams:
//! - The framed-message transport pipe and endpoint (`framed`)
//! - The TLS stream adapter with its engine traits (`tls`)
//! - The WebSocket stream adapter and HTTP upgrade (`ws`)
//! - URL scheme to stream factory mapping (`scheme`)
//!
//! Nothing here knows about sockets or messaging patterns; that lives in
//! the `hawser` crate on top.

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod framed;
pub mod scheme;
pub mod tls;
pub mod ws;

pub use framed::{SpEndpoint, SpPipe};
