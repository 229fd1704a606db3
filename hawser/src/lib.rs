//! Hawser
//!
//! A brokerless scalability-protocols messaging library. Sockets speak
//! small messaging patterns over framed byte-stream transports (TCP, TLS,
//! IPC, WebSocket); everything is driven by one-shot asynchronous
//! operation handles ([`Aio`]).
//!
//! ```no_run
//! use hawser::bus;
//!
//! let s1 = bus::open();
//! let s2 = bus::open();
//! s1.listen("tcp://127.0.0.1:5757").unwrap();
//! s2.dial("tcp://127.0.0.1:5757").unwrap();
//!
//! s1.send_msg(hawser::Msg::from_bytes(b"hello")).unwrap();
//! let msg = s2.recv_msg().unwrap();
//! assert_eq!(msg.body(), b"hello");
//! ```

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod bus;
pub mod endpoint;
pub mod pipe;
pub mod proto;
pub mod socket;

pub use hawser_core::addr::Addr;
pub use hawser_core::aio::{sleep_aio, Aio, Timeout};
pub use hawser_core::error::{Error, Result};
pub use hawser_core::msg::Msg;
pub use hawser_core::system::{self, InitParams};
pub use hawser_sp::tls::{TlsConfig, TlsMode};

pub use endpoint::{Dialer, Listener};
pub use pipe::Pipe;
pub use socket::Socket;

pub mod prelude {
    pub use crate::bus;
    pub use crate::{Aio, Error, Msg, Pipe, Result, Socket, Timeout};
}
