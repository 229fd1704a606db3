//! Minimal HTTP/1.1 request/response codec.
//!
//! Only what the WebSocket upgrade exchange needs: one request and one
//! response per connection, headers as flat name/value pairs, incremental
//! parsing that reports how many bytes the head consumed (anything after
//! it belongs to the WebSocket layer).

use bytes::{BufMut, Bytes, BytesMut};

use hawser_core::error::{Error, Result};

pub const STATUS_SWITCHING: u16 = 101;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_METHOD_NOT_ALLOWED: u16 = 405;
pub const STATUS_CONTENT_TOO_LARGE: u16 = 413;
pub const STATUS_INTERNAL: u16 = 500;
pub const STATUS_SERVICE_UNAVAILABLE: u16 = 503;
pub const STATUS_VERSION_NOT_SUPP: u16 = 505;

#[must_use]
pub fn status_reason(status: u16) -> &'static str {
    match status {
        STATUS_SWITCHING => "Switching Protocols",
        200 => "OK",
        STATUS_BAD_REQUEST => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        STATUS_NOT_FOUND => "Not Found",
        STATUS_METHOD_NOT_ALLOWED => "Method Not Allowed",
        STATUS_CONTENT_TOO_LARGE => "Content Too Large",
        STATUS_INTERNAL => "Internal Server Error",
        501 => "Not Implemented",
        STATUS_SERVICE_UNAVAILABLE => "Service Unavailable",
        STATUS_VERSION_NOT_SUPP => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Case-insensitive lookup in a header list.
#[must_use]
pub fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Insert or replace a header, case-insensitively.
pub fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    for (n, v) in headers.iter_mut() {
        if n.eq_ignore_ascii_case(name) {
            *v = value.to_string();
            return;
        }
    }
    headers.push((name.to_string(), value.to_string()));
}

/// Look for `word` in a comma/space separated phrase, case-insensitively.
#[must_use]
pub fn contains_word(phrase: &str, word: &str) -> bool {
    phrase
        .split([' ', ','])
        .filter(|w| !w.is_empty())
        .any(|w| w.eq_ignore_ascii_case(word))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn parse_headers(lines: std::str::Lines<'_>) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(Error::Proto)?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// An HTTP request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    #[must_use]
    pub fn get(uri: &str) -> Self {
        Self {
            method: "GET".to_string(),
            uri: uri.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
        }
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        get_header(&self.headers, name)
    }

    /// Parse a request head. `Ok(None)` means more bytes are needed; on
    /// success the consumed length is returned alongside.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(end) = find_head_end(buf) else {
            return Ok(None);
        };
        let head = std::str::from_utf8(&buf[..end - 4]).map_err(|_| Error::Proto)?;
        let mut lines = head.lines();
        let start = lines.next().ok_or(Error::Proto)?;
        let mut parts = start.split_whitespace();
        let method = parts.next().ok_or(Error::Proto)?.to_string();
        let uri = parts.next().ok_or(Error::Proto)?.to_string();
        let version = parts.next().ok_or(Error::Proto)?.to_string();
        let headers = parse_headers(lines)?;
        Ok(Some((
            Self {
                method,
                uri,
                version,
                headers,
            },
            end,
        )))
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(self.method.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.uri.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.version.as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

/// An HTTP response head.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl Response {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: status_reason(status).to_string(),
            headers: Vec::new(),
        }
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        get_header(&self.headers, name)
    }

    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(end) = find_head_end(buf) else {
            return Ok(None);
        };
        let head = std::str::from_utf8(&buf[..end - 4]).map_err(|_| Error::Proto)?;
        let mut lines = head.lines();
        let start = lines.next().ok_or(Error::Proto)?;
        let mut parts = start.splitn(3, ' ');
        let version = parts.next().ok_or(Error::Proto)?;
        if !version.starts_with("HTTP/1.") {
            return Err(Error::Proto);
        }
        let status: u16 = parts
            .next()
            .ok_or(Error::Proto)?
            .parse()
            .map_err(|_| Error::Proto)?;
        let reason = parts.next().unwrap_or("").to_string();
        let headers = parse_headers(lines)?;
        Ok(Some((
            Self {
                status,
                reason,
                headers,
            },
            end,
        )))
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(b"HTTP/1.1 ");
        out.put_slice(self.status.to_string().as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.reason.as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let mut req = Request::get("/bus");
        req.set_header("Host", "127.0.0.1:8080");
        req.set_header("Upgrade", "websocket");
        let wire = req.encode();

        let (parsed, used) = Request::parse(&wire).unwrap().unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.uri, "/bus");
        assert_eq!(parsed.version, "HTTP/1.1");
        assert_eq!(parsed.header("upgrade"), Some("websocket"));
    }

    #[test]
    fn test_parse_incomplete() {
        assert!(Request::parse(b"GET / HTTP/1.1\r\nHost: x\r\n")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_reports_leftover_boundary() {
        let wire = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi";
        let (resp, used) = Response::parse(wire).unwrap().unwrap();
        assert_eq!(resp.status, 101);
        assert_eq!(&wire[used..], b"\x81\x02hi");
    }

    #[test]
    fn test_contains_word() {
        assert!(contains_word("keep-alive, Upgrade", "upgrade"));
        assert!(contains_word("chat superchat", "CHAT"));
        assert!(!contains_word("keep-alive", "upgrade"));
    }

    #[test]
    fn test_bad_header_line() {
        assert!(Request::parse(b"GET / HTTP/1.1\r\nbogus\r\n\r\n").is_err());
    }
}
