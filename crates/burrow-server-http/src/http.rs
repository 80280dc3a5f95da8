//! Minimal HTTP/1.x head handling
//!
//! Just enough parsing to route a request and frame it onto a tunnel
//! stream: the request line plus the raw header pairs in received order.
//! Nothing is normalized, de-duplicated, or re-cased; the tunnel client
//! sees the headers exactly as the caller sent them.

use crate::server::IngressError;

/// Parsed request head with headers in original order.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a head block (request line through the blank line).
    pub fn parse(raw: &[u8]) -> Result<Self, IngressError> {
        let text = std::str::from_utf8(raw).map_err(|_| IngressError::MalformedHead)?;

        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or(IngressError::MalformedHead)?;

        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or(IngressError::MalformedHead)?.to_string();
        let uri = parts.next().ok_or(IngressError::MalformedHead)?.to_string();
        let version = parts.next().ok_or(IngressError::MalformedHead)?.to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let colon = line.find(':').ok_or(IngressError::MalformedHead)?;
            let name = line[..colon].to_string();
            let value = line[colon + 1..].trim_start().to_string();
            headers.push((name, value));
        }

        Ok(Self {
            method,
            uri,
            version,
            headers,
        })
    }

    /// First header matching `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Request path without any query string.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }

    /// Whether the caller asked to switch protocols.
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade").is_some()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    /// Serialize the head back to wire form: request line, headers in
    /// received order, terminating blank line.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.uri.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Byte offset just past the `\r\n\r\n` head terminator, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Whether a chunked body collected so far ends with the terminal
/// zero-chunk.
pub fn chunked_body_complete(body: &[u8]) -> bool {
    body == b"0\r\n\r\n" || body.ends_with(b"\r\n0\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &[u8] = b"POST /submit?x=1 HTTP/1.1\r\nHost: alice.example.com\r\nX-Custom: one\r\nx-custom: two\r\n\r\n";

    #[test]
    fn test_parse_request_line() {
        let head = RequestHead::parse(HEAD).unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.uri, "/submit?x=1");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.path(), "/submit");
    }

    #[test]
    fn test_headers_keep_order_and_case() {
        let head = RequestHead::parse(HEAD).unwrap();
        assert_eq!(
            head.headers,
            vec![
                ("Host".to_string(), "alice.example.com".to_string()),
                ("X-Custom".to_string(), "one".to_string()),
                ("x-custom".to_string(), "two".to_string()),
            ]
        );
        // Lookup is case-insensitive and returns the first match
        assert_eq!(head.header("X-CUSTOM"), Some("one"));
    }

    #[test]
    fn test_serialize_round_trips() {
        let head = RequestHead::parse(HEAD).unwrap();
        assert_eq!(head.serialize(), HEAD);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(RequestHead::parse(b"").is_err());
        assert!(RequestHead::parse(b"GET\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET /\r\n\r\n").is_err());
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n").is_err());
    }

    #[test]
    fn test_upgrade_detection() {
        let upgrade = RequestHead::parse(
            b"GET /chat HTTP/1.1\r\nHost: a.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap();
        assert!(upgrade.is_upgrade());

        let plain = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: a.example.com\r\n\r\n").unwrap();
        assert!(!plain.is_upgrade());
    }

    #[test]
    fn test_body_framing_headers() {
        let head = RequestHead::parse(
            b"POST / HTTP/1.1\r\nHost: a.example.com\r\nContent-Length: 42\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.content_length(), Some(42));
        assert!(!head.is_chunked());

        let chunked = RequestHead::parse(
            b"POST / HTTP/1.1\r\nHost: a.example.com\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
        )
        .unwrap();
        assert!(chunked.is_chunked());
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_chunked_body_complete() {
        assert!(chunked_body_complete(b"0\r\n\r\n"));
        assert!(chunked_body_complete(b"5\r\nhello\r\n0\r\n\r\n"));
        assert!(!chunked_body_complete(b"5\r\nhello\r\n"));
        assert!(!chunked_body_complete(b""));
    }
}
