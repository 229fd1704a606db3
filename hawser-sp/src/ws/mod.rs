//! WebSocket stream adapter (RFC 6455).
//!
//! An HTTP/1.1 upgrade exchange (`http`), the frame codec (`frame`), and
//! the connection state machine with its dialer and listener (`stream`).
//! Two user-visible modes: stream (bytes across arbitrary frame
//! boundaries) and message (one assembled message per receive).

pub mod frame;
pub mod http;
pub mod stream;

pub use stream::{WsDialer, WsListener, WsMode, WsStream};

/// Write-side extra header options use this prefix; the header name
/// follows the colon.
pub const HEADER_PROP_PREFIX: &str = "ws.header:";

/// Well-known WebSocket property names.
pub mod props {
    /// Largest accepted inbound frame (0 = unlimited).
    pub const RECVMAX_FRAME: &str = "ws.recvmax-frame";
    /// Outbound fragmentation threshold (0 = never fragment).
    pub const SENDMAX_FRAME: &str = "ws.sendmax-frame";
    /// Subprotocol word list, comma/space separated.
    pub const PROTOCOL: &str = "ws.protocol";
    /// Accept inbound TEXT frames.
    pub const RECV_TEXT: &str = "ws.recv-text";
    /// Emit TEXT instead of BINARY data frames.
    pub const SEND_TEXT: &str = "ws.send-text";
}
