//! Hawser error codes.
//!
//! The variants here are contracts shared by every layer: providers record
//! them into AIO results, transports surface them through pipes, and the
//! socket layer hands them to applications unchanged.

use std::io;
use thiserror::Error;

/// Error codes surfaced through AIO results and option surfaces.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Allocation failed; the operation did not start or complete
    #[error("Out of memory")]
    NoMem,

    /// The object (aio, pipe, endpoint, socket) has been closed
    #[error("Object closed")]
    Closed,

    /// The object has been stopped and refuses new work
    #[error("Object stopped")]
    Stopped,

    /// A user or higher layer requested cancellation
    #[error("Operation canceled")]
    Canceled,

    /// The operation's deadline elapsed before completion
    #[error("Timed out")]
    TimedOut,

    /// Peer violated the wire protocol
    #[error("Protocol error")]
    Proto,

    /// Inbound message exceeded the receive limit
    #[error("Message too large")]
    MsgSize,

    /// Peer closed the connection mid-operation
    #[error("Connection shutdown")]
    ConnShut,

    /// Peer refused the connection
    #[error("Connection refused")]
    ConnRefused,

    /// Connection attempt aborted in transit
    #[error("Connection aborted")]
    ConnAborted,

    /// Resource is busy (outstanding accept/connect, config in use)
    #[error("Resource busy")]
    Busy,

    /// Invalid argument
    #[error("Invalid argument")]
    Inval,

    /// Incorrect type for option
    #[error("Incorrect type")]
    BadType,

    /// Address is invalid for this transport
    #[error("Address invalid")]
    AddrInval,

    /// Address is already in use
    #[error("Address in use")]
    AddrInUse,

    /// Option or operation not supported by the target subsystem
    #[error("Not supported")]
    NotSup,

    /// Operation refused by peer policy (e.g. HTTP 401/403)
    #[error("Permission denied")]
    Perm,

    /// No such entry (pipe id lookup)
    #[error("No such entry")]
    NoEnt,

    /// Out of file descriptors
    #[error("Out of files")]
    NoFiles,

    /// Operation invalid for the object's current state
    #[error("Incorrect state")]
    State,

    /// Internal flow-control signal: retry when more buffer space or data
    /// is available. Never surfaced to applications.
    #[error("Resource temporarily unavailable")]
    Again,

    /// Unclassified operating system error
    #[error("System error {0}")]
    SystemErr(i32),
}

/// Result type alias for hawser operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True if this error indicates the peer or local side tore the
    /// connection down, as opposed to a transient or usage error.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Stopped | Self::ConnShut | Self::ConnAborted | Self::ConnRefused
        )
    }

    /// True for the terminal teardown codes an endpoint loop must not
    /// retry after.
    #[must_use]
    pub const fn is_teardown(&self) -> bool {
        matches!(self, Self::Closed | Self::Stopped)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::ConnShut,
            io::ErrorKind::ConnectionAborted => Self::ConnAborted,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut,
            io::ErrorKind::AddrInUse => Self::AddrInUse,
            io::ErrorKind::AddrNotAvailable => Self::AddrInval,
            io::ErrorKind::PermissionDenied => Self::Perm,
            io::ErrorKind::InvalidInput => Self::Inval,
            io::ErrorKind::NotFound => Self::NoEnt,
            io::ErrorKind::OutOfMemory => Self::NoMem,
            _ => Self::SystemErr(err.raw_os_error().unwrap_or(-1)),
        }
    }
}
