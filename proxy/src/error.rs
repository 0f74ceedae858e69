//! Error types for the forward proxy
//!
//! This module provides error types for the proxy server and the status API.

use proxycop_core::PolicyError;
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

/// Result type for the proxy
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error type for the proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Policy engine error
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address parsing error
    #[error("Address parsing error: {0}")]
    AddrParse(#[from] AddrParseError),

    /// Malformed or unsupported HTTP from the client
    #[error("HTTP protocol error: {0}")]
    Protocol(String),

    /// Upstream host could not be reached
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Timed out waiting on a client or upstream
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

impl From<config::ConfigError> for ProxyError {
    fn from(err: config::ConfigError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ProxyError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProxyError::Server(format!("Worker task failed: {}", err))
    }
}

/// Map a proxy error to the HTTP status line sent back to the client
pub fn to_http_status(error: &ProxyError) -> (u16, &'static str) {
    match error {
        ProxyError::Protocol(_) => (400, "Bad Request"),
        ProxyError::Upstream(_) => (502, "Bad Gateway"),
        ProxyError::Timeout(_) => (504, "Gateway Timeout"),
        _ => (500, "Internal Server Error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let err: ProxyError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, ProxyError::Io(_)));

        let err: ProxyError = PolicyError::InvalidHost("".to_string()).into();
        assert!(matches!(err, ProxyError::Policy(_)));

        let err: ProxyError = "nope".parse::<std::net::SocketAddr>().unwrap_err().into();
        assert!(matches!(err, ProxyError::AddrParse(_)));
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(to_http_status(&ProxyError::Protocol("x".into())), (400, "Bad Request"));
        assert_eq!(to_http_status(&ProxyError::Upstream("x".into())), (502, "Bad Gateway"));
        assert_eq!(to_http_status(&ProxyError::Timeout("x".into())), (504, "Gateway Timeout"));
        assert_eq!(
            to_http_status(&ProxyError::Server("x".into())),
            (500, "Internal Server Error")
        );
    }
}
