//! Transport addresses.
//!
//! Unified addressing for the built-in transports with parsing support.

use std::fmt;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    /// Plain framed TCP: `tcp://host:port`
    Tcp(SocketAddr),
    /// TLS over TCP: `tls+tcp://host:port`
    TlsTcp(SocketAddr),
    /// IPC (Unix domain socket): `ipc:///path/to/socket`
    #[cfg(unix)]
    Ipc(PathBuf),
    /// WebSocket: `ws://host:port/path`
    Ws(WsAddr),
}

/// WebSocket address parts: TCP authority plus the HTTP upgrade path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WsAddr {
    pub addr: SocketAddr,
    /// Authority string as written, for the Host header.
    pub host: String,
    pub path: String,
}

impl Addr {
    /// Parse an address from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:5555`
    /// - `tcp://[::1]:5555` (IPv6)
    /// - `tls+tcp://127.0.0.1:5556`
    /// - `ipc:///tmp/socket.sock` (Unix only)
    /// - `ws://127.0.0.1:5557/bus`
    ///
    /// # Examples
    ///
    /// ```
    /// use hawser_core::addr::Addr;
    ///
    /// let addr = Addr::parse("tcp://127.0.0.1:5555").unwrap();
    /// assert!(matches!(addr, Addr::Tcp(_)));
    ///
    /// let addr = Addr::parse("ws://127.0.0.1:8080/bus").unwrap();
    /// assert!(matches!(addr, Addr::Ws(_)));
    /// ```
    pub fn parse(s: &str) -> Result<Self, Error> {
        s.parse()
    }

    /// Returns true if this address selects the TLS transport.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Addr::TlsTcp(_))
    }
}

fn parse_sockaddr(s: &str) -> Result<SocketAddr, Error> {
    s.parse::<SocketAddr>().map_err(|_| Error::AddrInval)
}

impl FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            Ok(Addr::Tcp(parse_sockaddr(rest)?))
        } else if let Some(rest) = s.strip_prefix("tls+tcp://") {
            Ok(Addr::TlsTcp(parse_sockaddr(rest)?))
        } else if let Some(rest) = s.strip_prefix("ws://") {
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            Ok(Addr::Ws(WsAddr {
                addr: parse_sockaddr(authority)?,
                host: authority.to_string(),
                path: path.to_string(),
            }))
        } else if let Some(path) = s.strip_prefix("ipc://") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(Error::AddrInval);
                }
                Ok(Addr::Ipc(PathBuf::from(path)))
            }
            #[cfg(not(unix))]
            {
                Err(Error::NotSup)
            }
        } else {
            Err(Error::AddrInval)
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Tcp(addr) => write!(f, "tcp://{addr}"),
            Addr::TlsTcp(addr) => write!(f, "tls+tcp://{addr}"),
            #[cfg(unix)]
            Addr::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Addr::Ws(ws) => write!(f, "ws://{}{}", ws.host, ws.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_ipv4() {
        let addr = Addr::parse("tcp://127.0.0.1:5555").unwrap();
        assert!(matches!(addr, Addr::Tcp(_)));
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn test_parse_tcp_ipv6() {
        let addr = Addr::parse("tcp://[::1]:5555").unwrap();
        assert!(matches!(addr, Addr::Tcp(_)));
    }

    #[test]
    fn test_parse_tls() {
        let addr = Addr::parse("tls+tcp://127.0.0.1:5556").unwrap();
        assert!(addr.is_tls());
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_ipc() {
        let addr = Addr::parse("ipc:///tmp/test.sock").unwrap();
        assert!(matches!(addr, Addr::Ipc(_)));
        assert_eq!(addr.to_string(), "ipc:///tmp/test.sock");
    }

    #[test]
    fn test_parse_ws_with_path() {
        let addr = Addr::parse("ws://127.0.0.1:8080/bus").unwrap();
        let Addr::Ws(ws) = addr else { panic!() };
        assert_eq!(ws.path, "/bus");
        assert_eq!(ws.host, "127.0.0.1:8080");
    }

    #[test]
    fn test_parse_ws_default_path() {
        let Addr::Ws(ws) = Addr::parse("ws://127.0.0.1:8080").unwrap() else {
            panic!()
        };
        assert_eq!(ws.path, "/");
    }

    #[test]
    fn test_invalid_scheme() {
        assert_eq!(Addr::parse("http://127.0.0.1:80"), Err(Error::AddrInval));
    }

    #[test]
    fn test_invalid_tcp_address() {
        assert_eq!(Addr::parse("tcp://invalid:port"), Err(Error::AddrInval));
    }
}
