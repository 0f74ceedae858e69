//! proxycop - a forward proxy that keeps distraction sites out of reach
//!
//! This is the root crate that ties the workspace together.
//! Actual implementation is in the subcrates:
//! - `proxycop-core`: Policy store and admission-control decision engine
//! - `proxycop-proxy`: Forward proxy server and status API

pub use proxycop_core as engine;
pub use proxycop_proxy as proxy;

/// Returns the version of the package.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
