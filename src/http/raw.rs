//! Raw HTTP request templates and response parsing for the unsafe path.
//!
//! Raw requests are written literally over the socket with no header
//! normalization; the parsed form only feeds event recording and the
//! normalized replay path.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

/// A raw request template after placeholder expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawRequest {
    /// Parses `METHOD URI [HTTP/x]`, header lines, blank line, body.
    pub fn parse(text: &str) -> Result<Self> {
        let normalized = text.replace("\r\n", "\n");
        let mut lines = normalized.split('\n');

        let request_line = lines
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| anyhow!("raw request is empty"))?;

        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| anyhow!("raw request has no method"))?
            .to_uppercase();
        let uri = parts
            .next()
            .ok_or_else(|| anyhow!("raw request has no URI"))?
            .to_string();

        let mut headers = Vec::new();
        let mut body = String::new();
        let mut in_body = false;
        for line in lines {
            if in_body {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(line);
            } else if line.trim().is_empty() {
                in_body = true;
            } else if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            } else {
                return Err(anyhow!("malformed header line '{}'", line));
            }
        }

        Ok(Self {
            method,
            uri,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Serializes an expanded raw template to wire bytes, normalizing only
/// line endings to CRLF. Content is otherwise untouched: no Host or
/// Content-Length injection, path exactly as written.
pub fn to_wire_bytes(text: &str) -> Vec<u8> {
    let normalized = text.replace("\r\n", "\n");
    let (head, body) = match normalized.split_once("\n\n") {
        Some((head, body)) => (head.to_string(), Some(body.to_string())),
        None => (normalized.trim_end_matches('\n').to_string(), None),
    };

    let mut out = head.replace('\n', "\r\n").into_bytes();
    out.extend_from_slice(b"\r\n\r\n");
    if let Some(body) = body {
        out.extend_from_slice(body.as_bytes());
    }
    out
}

/// A parsed HTTP/1.x response read off a raw socket.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Splits raw response bytes into status, headers and body. Lenient:
/// anything before the first blank line that does not look like a header
/// is skipped.
pub fn parse_response(bytes: &[u8]) -> Result<RawResponse> {
    let split = find_header_end(bytes);
    let (head, body) = match split {
        Some(at) => (&bytes[..at], &bytes[at + 4..]),
        None => (bytes, &[][..]),
    };
    let head = String::from_utf8_lossy(head);
    let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));

    let status_line = lines
        .next()
        .ok_or_else(|| anyhow!("empty response"))?
        .trim();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("malformed status line '{}'", status_line))?;

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    Ok(RawResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}

fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_headers_and_body() {
        let raw = "POST /login HTTP/1.1\nHost: example.com\nContent-Type: application/x-www-form-urlencoded\n\nuser=admin&pass=x";
        let req = RawRequest::parse(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.uri, "/login");
        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(req.body, "user=admin&pass=x");
    }

    #[test]
    fn parses_request_without_body() {
        let req = RawRequest::parse("GET /probe HTTP/1.1\nHost: x\n").unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.body.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        assert!(RawRequest::parse("").is_err());
        assert!(RawRequest::parse("GET").is_err());
    }

    #[test]
    fn wire_bytes_use_crlf_and_preserve_body() {
        let bytes = to_wire_bytes("GET /a HTTP/1.1\nHost: x\n\nbody");
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "GET /a HTTP/1.1\r\nHost: x\r\n\r\nbody");
    }

    #[test]
    fn wire_bytes_terminate_headers_without_body() {
        let bytes = to_wire_bytes("GET / HTTP/1.1\nHost: x");
        assert!(bytes.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn parses_response() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: Apache\r\nContent-Length: 5\r\n\r\nhello";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("server").map(String::as_str), Some("Apache"));
        assert_eq!(resp.body, b"hello");
    }

    #[test]
    fn parses_headerless_response() {
        let resp = parse_response(b"HTTP/1.0 404 Not Found\r\n\r\n").unwrap();
        assert_eq!(resp.status, 404);
        assert!(resp.body.is_empty());
    }
}
