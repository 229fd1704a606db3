//! URL scheme to stream factory mapping.
//!
//! The set of built-in transports is closed, so this is a plain match
//! rather than a registration table. Every scheme produces the stream
//! dialer/listener the framed transport runs over; WebSocket endpoints
//! operate in stream mode so the framed layer keeps its own length
//! prefix.

use std::sync::Arc;

use hawser_core::addr::Addr;
use hawser_core::error::Result;
use hawser_core::platform::{TcpDialer, TcpListener};
use hawser_core::stream::{StreamDialer, StreamListener};

use crate::tls::{TlsConfig, TlsDialer, TlsListener, TlsMode};
use crate::ws::{WsDialer, WsListener, WsMode};

/// Build the stream dialer for `addr`. A TLS config applies only to the
/// `tls+tcp` scheme; `None` gets a default client config.
pub fn dialer_for(addr: &Addr, tls: Option<Arc<TlsConfig>>) -> Result<Box<dyn StreamDialer>> {
    Ok(match addr {
        Addr::Tcp(sa) => Box::new(TcpDialer::new(*sa)),
        Addr::TlsTcp(sa) => {
            let cfg = tls.unwrap_or_else(|| Arc::new(TlsConfig::new(TlsMode::Client)));
            Box::new(TlsDialer::new(Box::new(TcpDialer::new(*sa)), cfg))
        }
        #[cfg(unix)]
        Addr::Ipc(path) => Box::new(hawser_core::platform::IpcDialer::new(path.clone())),
        Addr::Ws(ws) => Box::new(WsDialer::new(
            Box::new(TcpDialer::new(ws.addr)),
            &ws.host,
            &ws.path,
            WsMode::Stream,
        )),
    })
}

/// Build the stream listener for `addr`.
pub fn listener_for(addr: &Addr, tls: Option<Arc<TlsConfig>>) -> Result<Box<dyn StreamListener>> {
    Ok(match addr {
        Addr::Tcp(sa) => Box::new(TcpListener::new(*sa)),
        Addr::TlsTcp(sa) => {
            let cfg = tls.unwrap_or_else(|| Arc::new(TlsConfig::new(TlsMode::Server)));
            Box::new(TlsListener::new(Box::new(TcpListener::new(*sa)), cfg))
        }
        #[cfg(unix)]
        Addr::Ipc(path) => Box::new(hawser_core::platform::IpcListener::new(path.clone())),
        Addr::Ws(ws) => Box::new(WsListener::new(
            Box::new(TcpListener::new(ws.addr)),
            &ws.path,
            WsMode::Stream,
        )),
    })
}
