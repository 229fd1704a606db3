//! Byte-stream abstraction.
//!
//! Connected streams, stream dialers, and stream listeners are the
//! polymorphic seam between transports and the platform. Transports that
//! want to be user-pluggable implement these traits; the closed set of
//! built-in schemes is matched in `hawser-sp`.

use crate::aio::Aio;
use crate::error::{Error, Result};

/// Property value for the get/set option surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Size(usize),
    Str(String),
}

impl PropValue {
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::Size(v) => Ok(*v as i64),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_size(&self) -> Result<usize> {
        match self {
            Self::Size(v) => Ok(*v),
            Self::Int(v) if *v >= 0 => Ok(*v as usize),
            Self::Int(_) => Err(Error::Inval),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Self::Str(s) => Ok(s),
            _ => Err(Error::BadType),
        }
    }
}

/// Well-known property names. Unknown names yield `NotSup` so option
/// namespaces can chain through layered objects.
pub mod props {
    pub const LOCAL_ADDR: &str = "local-addr";
    pub const REMOTE_ADDR: &str = "remote-addr";
    pub const RECV_MAX: &str = "recvmax";
    pub const TCP_NODELAY: &str = "tcp.no-delay";
    pub const TCP_BOUND_PORT: &str = "tcp.bound-port";
    pub const TLS_VERIFIED: &str = "tls.verified";
    pub const TLS_PEER_CN: &str = "tls.peer-cn";
}

/// A connected byte stream.
///
/// `send` consumes the AIO's transmit vector; `recv` fills its receive
/// window. Both report the transferred byte count through the AIO, and a
/// count smaller than requested is a legal completion (the caller
/// resubmits for the remainder).
pub trait Stream: Send + Sync {
    fn send(&self, aio: &Aio);
    fn recv(&self, aio: &Aio);
    /// Close the stream; idempotent. Pending and future operations fail
    /// with `Closed`.
    fn close(&self);
    /// Close, then wait for in-flight completion handlers to settle.
    fn stop(&self);
    fn get(&self, name: &str) -> Result<PropValue> {
        let _ = name;
        Err(Error::NotSup)
    }
    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        let _ = (name, value);
        Err(Error::NotSup)
    }
}

/// Creates outbound streams. The new stream arrives in output slot 0 of
/// the dial AIO as a `Box<dyn Stream>`.
pub trait StreamDialer: Send + Sync {
    fn dial(&self, aio: &Aio);
    fn close(&self);
    fn stop(&self);
    fn get(&self, name: &str) -> Result<PropValue> {
        let _ = name;
        Err(Error::NotSup)
    }
    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        let _ = (name, value);
        Err(Error::NotSup)
    }
}

/// Accepts inbound streams. The new stream arrives in output slot 0 of
/// the accept AIO as a `Box<dyn Stream>`.
pub trait StreamListener: Send + Sync {
    /// Bind and start listening. Must be called before `accept`.
    fn listen(&self) -> Result<()>;
    fn accept(&self, aio: &Aio);
    fn close(&self);
    fn stop(&self);
    fn get(&self, name: &str) -> Result<PropValue> {
        let _ = name;
        Err(Error::NotSup)
    }
    fn set(&self, name: &str, value: PropValue) -> Result<()> {
        let _ = (name, value);
        Err(Error::NotSup)
    }
}

/// Pull the stream a dial/accept completion delivered.
pub fn take_stream_output(aio: &Aio) -> Option<Box<dyn Stream>> {
    aio.take_output_as::<Box<dyn Stream>>(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prop_value_coercions() {
        assert_eq!(PropValue::Bool(true).as_bool(), Ok(true));
        assert_eq!(PropValue::Size(9).as_int(), Ok(9));
        assert_eq!(PropValue::Int(9).as_size(), Ok(9));
        assert_eq!(PropValue::Int(-1).as_size(), Err(Error::Inval));
        assert_eq!(PropValue::Str("x".into()).as_bool(), Err(Error::BadType));
    }
}
