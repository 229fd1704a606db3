//! Messages: opaque byte vectors with a header and a body.
//!
//! Ownership transfers through AIOs (`set_msg` / `take_msg`). A started
//! send consumes the message on success; on failure the completer drops it.

use bytes::{BufMut, Bytes, BytesMut};

/// A message with separately addressable header and body.
///
/// Transports treat header + body as one payload on the wire; protocols
/// use the header for routing metadata they strip before delivery.
///
/// # Examples
///
/// ```
/// use hawser_core::msg::Msg;
///
/// let mut msg = Msg::from_bytes(b"hello");
/// msg.header_mut().extend_from_slice(&[0x01]);
/// assert_eq!(msg.len(), 5);
/// assert_eq!(msg.header_len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Msg {
    header: BytesMut,
    body: BytesMut,
}

impl Msg {
    /// Create a new empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message with a body of `len` zero bytes.
    #[must_use]
    pub fn with_len(len: usize) -> Self {
        let mut body = BytesMut::with_capacity(len);
        body.resize(len, 0);
        Self {
            header: BytesMut::new(),
            body,
        }
    }

    /// Create a message whose body is a copy of `data`.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            header: BytesMut::new(),
            body: BytesMut::from(data),
        }
    }

    /// Create a message taking ownership of an already-filled body.
    #[must_use]
    pub fn from_body(body: BytesMut) -> Self {
        Self {
            header: BytesMut::new(),
            body,
        }
    }

    /// Body length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// True if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Header length in bytes.
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.header.len()
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut BytesMut {
        &mut self.header
    }

    /// Prepend bytes to the body.
    pub fn insert(&mut self, data: &[u8]) {
        let mut next = BytesMut::with_capacity(data.len() + self.body.len());
        next.put_slice(data);
        next.put_slice(&self.body);
        self.body = next;
    }

    /// Drop the header and freeze the body for zero-copy transmit.
    #[must_use]
    pub fn freeze_body(self) -> Bytes {
        self.body.freeze()
    }

    /// Freeze header and body as transmit segments.
    #[must_use]
    pub fn freeze_parts(self) -> (Bytes, Bytes) {
        (self.header.freeze(), self.body.freeze())
    }

    /// Clear header and body, keeping allocations.
    pub fn clear(&mut self) {
        self.header.clear();
        self.body.clear();
    }
}

impl From<&[u8]> for Msg {
    fn from(data: &[u8]) -> Self {
        Self::from_bytes(data)
    }
}

impl From<Vec<u8>> for Msg {
    fn from(data: Vec<u8>) -> Self {
        Self {
            header: BytesMut::new(),
            body: BytesMut::from(&data[..]),
        }
    }
}
