//! proxycop forward proxy
//!
//! This crate provides the network side of proxycop: an HTTP forward proxy
//! that asks the admission controller about every new connection, and a
//! small JSON API for status queries and policy administration.

// Error types and result
pub mod error;
pub use error::{ProxyError, Result};

// Configuration
pub mod config;
pub use config::ProxyConfig;

// HTTP request heads and proxy responses
pub mod protocol;
pub use protocol::{RequestHead, RequestTarget};

// Server implementation
pub mod server;
pub use server::ProxyServer;

// Status and administration API
pub mod api;
pub use api::create_router;
