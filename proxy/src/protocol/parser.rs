//! Request head parser and framing codec
use crate::error::{ProxyError, Result};
use crate::protocol::message::RequestHead;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// End of an HTTP head
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Default cap on the size of a request head
pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum number of headers accepted
const MAX_HEADERS: usize = 128;

/// Split `host[:port]` or `[v6]:port`.
///
/// With `default_port` a missing port is filled in; without it the port is
/// required.
pub fn split_host_port(authority: &str, default_port: Option<u16>) -> Result<(String, u16)> {
    let authority = authority.trim();
    let bad = || ProxyError::Protocol(format!("Invalid authority: {:?}", authority));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(bad)?;
        match after {
            "" => (host, None),
            _ => (host, Some(after.strip_prefix(':').ok_or_else(bad)?)),
        }
    } else {
        match authority.split_once(':') {
            Some((_, port)) if port.contains(':') => return Err(bad()),
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(bad());
    }

    let port = match port {
        Some(port) => match port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(bad()),
            Ok(port) => port,
        },
        None => default_port.ok_or_else(|| {
            ProxyError::Protocol(format!("Missing port in {:?}", authority))
        })?,
    };

    Ok((host.to_string(), port))
}

/// Parse a complete request head, terminator included or not
pub fn parse_request_head(bytes: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ProxyError::Protocol("Request head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| ProxyError::Protocol("Empty request".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => {
            return Err(ProxyError::Protocol(format!(
                "Malformed request line: {:?}",
                request_line
            )))
        }
    };

    if !version.starts_with("HTTP/1.") {
        return Err(ProxyError::Protocol(format!("Unsupported version: {}", version)));
    }

    let mut headers = Vec::new();
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::Protocol(format!("Malformed header: {:?}", line)))?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ProxyError::Protocol(format!("Malformed header: {:?}", line)));
        }
        headers.push((name.to_string(), value.trim().to_string()));
        if headers.len() > MAX_HEADERS {
            return Err(ProxyError::Protocol("Too many headers".to_string()));
        }
    }

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Frames the first request head off a client connection.
///
/// Bytes after the head stay in the read buffer for the caller to forward.
#[derive(Debug, Clone)]
pub struct HeadCodec {
    max_head_bytes: usize,
}

impl HeadCodec {
    /// Create a codec refusing heads larger than `max_head_bytes`
    pub fn new(max_head_bytes: usize) -> Self {
        Self { max_head_bytes }
    }
}

impl Default for HeadCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEAD_BYTES)
    }
}

impl Decoder for HeadCodec {
    type Item = RequestHead;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RequestHead>> {
        let end = src
            .windows(HEAD_TERMINATOR.len())
            .position(|window| window == HEAD_TERMINATOR);

        match end {
            Some(end) if end + HEAD_TERMINATOR.len() > self.max_head_bytes => {
                Err(ProxyError::Protocol("Request head too large".to_string()))
            }
            Some(end) => {
                let head = src.split_to(end + HEAD_TERMINATOR.len());
                parse_request_head(&head[..end]).map(Some)
            }
            None if src.len() >= self.max_head_bytes => {
                Err(ProxyError::Protocol("Request head too large".to_string()))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example.com:443", None, "example.com", 443)]
    #[case("example.com", Some(80), "example.com", 80)]
    #[case("example.com:8080", Some(80), "example.com", 8080)]
    #[case("[::1]:443", None, "::1", 443)]
    #[case("[::1]", Some(80), "::1", 80)]
    fn test_split_host_port(
        #[case] authority: &str,
        #[case] default: Option<u16>,
        #[case] host: &str,
        #[case] port: u16,
    ) {
        assert_eq!(split_host_port(authority, default).unwrap(), (host.to_string(), port));
    }

    #[rstest]
    #[case("example.com", None)]
    #[case(":443", None)]
    #[case("example.com:0", None)]
    #[case("example.com:99999", None)]
    #[case("example.com:http", Some(80))]
    #[case("::1:443", None)]
    #[case("[::1", Some(80))]
    #[case("[::1]x", Some(80))]
    fn test_split_host_port_rejects(#[case] authority: &str, #[case] default: Option<u16>) {
        assert!(split_host_port(authority, default).is_err());
    }

    #[test]
    fn test_parse_request_head() {
        let head = parse_request_head(
            b"GET http://a.example/ HTTP/1.1\r\nHost: a.example\r\nProxy-Connection: keep-alive\r\n",
        )
        .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://a.example/");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("a.example"));
        assert_eq!(head.headers.len(), 2);
    }

    #[rstest]
    #[case(&b""[..])]
    #[case(&b"GET /\r\n"[..])]
    #[case(&b"GET / HTTP/2\r\n"[..])]
    #[case(&b"GET / HTTP/1.1\r\nno-colon\r\n"[..])]
    #[case(&b"GET / HTTP/1.1\r\nbad name: x\r\n"[..])]
    #[case(&b"GET / HTTP/1.1\r\n\xff: x\r\n"[..])]
    fn test_parse_request_head_rejects(#[case] raw: &[u8]) {
        assert!(matches!(parse_request_head(raw), Err(ProxyError::Protocol(_))));
    }

    #[test]
    fn test_codec_waits_for_full_head() {
        let mut codec = HeadCodec::default();
        let mut buf = BytesMut::from(&b"CONNECT a.example:443 HTTP/1.1\r\nHost: a"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b".example:443\r\n\r\nEXTRA");
        let head = codec.decode(&mut buf).unwrap().unwrap();
        assert!(head.is_connect());
        assert_eq!(&buf[..], b"EXTRA");
    }

    #[test]
    fn test_codec_enforces_limit() {
        let mut codec = HeadCodec::new(16);
        let mut buf = BytesMut::from(&b"GET http://a.example/ HTTP/1.1\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut codec = HeadCodec::new(16);
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
