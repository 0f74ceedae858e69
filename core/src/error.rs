//! Error types for the core crate
//!
//! A missing key is never an error here: store reads return `Ok(None)` for
//! NotFound, and `Err` only for genuine storage failures.

use thiserror::Error;
use std::io;

/// Core error type
#[derive(Error, Debug)]
pub enum PolicyError {
    /// Storage engine failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The store was written by an incompatible key schema
    #[error("Schema mismatch: store is version {found}, expected {expected}")]
    SchemaMismatch {
        /// Version recorded in the store
        found: String,
        /// Version this build understands
        expected: u32,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Hostname that cannot be used as a policy key
    #[error("Invalid host: {0:?}")]
    InvalidHost(String),
}

/// Result type for the core crate
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Convert a displayable error to a ConfigError
pub fn to_config_error<E: std::fmt::Display>(err: E) -> PolicyError {
    PolicyError::Config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "read-only");
        let err: PolicyError = io_err.into();
        match err {
            PolicyError::Io(_) => {}
            _ => panic!("Expected Io variant"),
        }

        let sql_err = rusqlite::Error::InvalidQuery;
        let err: PolicyError = sql_err.into();
        match err {
            PolicyError::Storage(_) => {}
            _ => panic!("Expected Storage variant"),
        }

        match to_config_error("bad seed") {
            PolicyError::Config(msg) => assert_eq!(msg, "bad seed"),
            _ => panic!("Expected Config variant"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = PolicyError::SchemaMismatch { found: "0".to_string(), expected: 1 };
        assert_eq!(err.to_string(), "Schema mismatch: store is version 0, expected 1");

        let err = PolicyError::InvalidHost("".to_string());
        assert_eq!(err.to_string(), "Invalid host: \"\"");
    }
}
