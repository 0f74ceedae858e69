//! # proxycop core
//!
//! Admission-control engine for the proxycop forward proxy.
//! This crate decides, per intercepted connection, whether the target host
//! may be visited: hosts on a permanent blacklist are always refused, and
//! hosts visited too recently are refused until their cooldown runs out.
//! Cooldowns and visit counters live in a durable key-value store so they
//! survive restarts.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod blacklist;
pub mod clock;
pub mod controller;
pub mod cooldown;
pub mod error;
pub mod host;
pub mod resolver;
pub mod schema;
pub mod session;
pub mod store;

/// Re-export common types for ease of use
pub use controller::{AdmissionConfig, AdmissionController, FailurePolicy, HostPolicy, InterceptionHook};
pub use error::{PolicyError, Result};
pub use resolver::{HostStatus, StatusResolver, Verdict};
pub use session::{SessionDecision, SessionId};
pub use store::{Expiry, PolicyStore};

/// Version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
