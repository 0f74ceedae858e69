//! HTTP/1.x proxy protocol handling
//!
//! Only the request head is ever parsed. Once the target is known the proxy
//! either answers itself (blocked page, errors) or splices raw bytes between
//! the client and the upstream.

/// Request head and target types
pub mod message;

/// Request head parser and framing codec
pub mod parser;

/// Response and upstream head formatting
pub mod formatter;

// Re-export common types
pub use self::formatter::{blocked_response, error_response, upstream_head, CONNECTION_ESTABLISHED};
pub use self::message::{RequestHead, RequestTarget};
pub use self::parser::{parse_request_head, split_host_port, HeadCodec};
