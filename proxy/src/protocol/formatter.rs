//! Response and upstream head formatting
//!
//! The proxy writes only a handful of responses of its own: the tunnel
//! handshake, the blocked page and error pages. Everything else is the
//! upstream's bytes.

use crate::protocol::message::RequestHead;
use bytes::{BufMut, Bytes, BytesMut};

/// Reply to an accepted `CONNECT`
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Hop-by-hop headers meant for the proxy itself
const PROXY_ONLY_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization", "keep-alive"];

/// Text response the client sees when a site is blocked
pub fn blocked_response(message: &str) -> Bytes {
    text_response(403, "Forbidden", message)
}

/// Error page for failures the proxy answers itself
pub fn error_response(status: u16, reason: &str, body: &str) -> Bytes {
    text_response(status, reason, body)
}

fn text_response(status: u16, reason: &str, body: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + body.len());
    buf.put_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    buf.put_slice(b"Content-Type: text/plain; charset=utf-8\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    buf.put_slice(b"Connection: close\r\n\r\n");
    buf.put_slice(body.as_bytes());
    buf.freeze()
}

/// Request head as sent to the upstream: origin-form target, proxy-only
/// headers dropped
pub fn upstream_head(head: &RequestHead, path: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(format!("{} {} {}\r\n", head.method, path, head.version).as_bytes());
    for (name, value) in &head.headers {
        if PROXY_ONLY_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_response() {
        let response = blocked_response("reddit.com is blacklisted");
        let text = std::str::from_utf8(&response).unwrap();

        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Content-Length: 25\r\n"));
        assert!(text.ends_with("\r\n\r\nreddit.com is blacklisted"));
    }

    #[test]
    fn test_upstream_head_drops_proxy_headers() {
        let head = RequestHead {
            method: "GET".to_string(),
            target: "http://a.example/x".to_string(),
            version: "HTTP/1.1".to_string(),
            headers: vec![
                ("Host".to_string(), "a.example".to_string()),
                ("Proxy-Connection".to_string(), "keep-alive".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ],
        };

        assert_eq!(
            &upstream_head(&head, "/x")[..],
            &b"GET /x HTTP/1.1\r\nHost: a.example\r\nAccept: */*\r\n\r\n"[..]
        );
    }
}
