//! Request head and target types
use crate::error::{ProxyError, Result};
use crate::protocol::parser::split_host_port;

/// Default port for plain HTTP
pub const HTTP_PORT: u16 = 80;

/// Parsed HTTP request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request method, e.g. `GET` or `CONNECT`
    pub method: String,

    /// Raw request target as sent by the client
    pub target: String,

    /// Protocol version, e.g. `HTTP/1.1`
    pub version: String,

    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
}

/// Where a proxied request is headed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// `CONNECT host:port`; the connection becomes an opaque tunnel
    Tunnel {
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// Plain HTTP request to be forwarded
    Forward {
        /// Target host
        host: String,
        /// Target port
        port: u16,
        /// Origin-form path and query sent upstream
        path: String,
    },
}

impl RequestTarget {
    /// Target hostname without port
    pub fn host(&self) -> &str {
        match self {
            RequestTarget::Tunnel { host, .. } | RequestTarget::Forward { host, .. } => host,
        }
    }

    /// Target port
    pub fn port(&self) -> u16 {
        match self {
            RequestTarget::Tunnel { port, .. } | RequestTarget::Forward { port, .. } => *port,
        }
    }

    /// `host:port` suitable for connecting
    pub fn authority(&self) -> String {
        if self.host().contains(':') {
            format!("[{}]:{}", self.host(), self.port())
        } else {
            format!("{}:{}", self.host(), self.port())
        }
    }
}

impl RequestHead {
    /// First header named `name`, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether this is a `CONNECT` request
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Work out where the request is going.
    ///
    /// Accepts `CONNECT` authority-form, `http://` absolute-form and
    /// origin-form with a `Host` header. `https://` absolute-form is refused
    /// since it cannot be forwarded without TLS.
    pub fn request_target(&self) -> Result<RequestTarget> {
        if self.is_connect() {
            let (host, port) = split_host_port(&self.target, None)?;
            return Ok(RequestTarget::Tunnel { host, port });
        }

        if let Some(rest) = strip_scheme(&self.target, "http://") {
            let (authority, path) = match rest.find(['/', '?']) {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            let (host, port) = split_host_port(authority, Some(HTTP_PORT))?;
            let path = if path.starts_with('?') {
                format!("/{}", path)
            } else {
                path.to_string()
            };
            return Ok(RequestTarget::Forward { host, port, path });
        }

        if strip_scheme(&self.target, "https://").is_some() {
            return Err(ProxyError::Protocol(
                "https:// requests must use CONNECT".to_string(),
            ));
        }

        if self.target.starts_with('/') {
            let authority = self
                .header("Host")
                .ok_or_else(|| ProxyError::Protocol("Missing Host header".to_string()))?;
            let (host, port) = split_host_port(authority, Some(HTTP_PORT))?;
            return Ok(RequestTarget::Forward {
                host,
                port,
                path: self.target.clone(),
            });
        }

        Err(ProxyError::Protocol(format!(
            "Unsupported request target: {}",
            self.target
        )))
    }
}

fn strip_scheme<'a>(target: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = target.get(..scheme.len())?;
    if prefix.eq_ignore_ascii_case(scheme) {
        Some(&target[scheme.len()..])
    } else {
        None
    }
}
