//! Configuration for the proxy server
//!
//! Settings come from, in increasing priority: built-in defaults, an
//! optional TOML file, `PROXYCOP_*` environment variables (nested keys use
//! `__`, e.g. `PROXYCOP_ADMISSION__FAILURE_POLICY=open`) and command-line
//! flags applied by `main`.

use crate::error::{ProxyError, Result};
use crate::protocol::parser::DEFAULT_MAX_HEAD_BYTES;
use proxycop_core::{AdmissionConfig, FailurePolicy, HostPolicy};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "PROXYCOP";

/// Proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listening address for the forward proxy
    pub listen_addr: SocketAddr,

    /// Listening address for the status API
    pub api_addr: SocketAddr,

    /// Policy store file, created if absent
    pub db_path: PathBuf,

    /// Admission controller settings
    pub admission: AdmissionConfig,

    /// Upstream connect timeout in seconds
    pub connect_timeout: u64,

    /// Time allowed for a client to send its request head, in seconds
    pub head_timeout: u64,

    /// Maximum size of a request head in bytes
    pub max_head_bytes: usize,

    /// Maximum number of concurrent client connections
    pub max_connections: usize,

    /// Log level used when `RUST_LOG` is unset
    pub log_level: String,

    /// Host policies applied at startup
    pub seed: Vec<HostPolicy>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            api_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 8081)),
            db_path: PathBuf::from("data.db"),
            admission: AdmissionConfig::default(),
            connect_timeout: 10,
            head_timeout: 30,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_connections: 1024,
            log_level: "info".to_string(),
            seed: default_seed(),
        }
    }
}

/// Out-of-the-box policies: the usual time sinks
fn default_seed() -> Vec<HostPolicy> {
    vec![
        HostPolicy::blacklisted("www.reddit.com"),
        HostPolicy::blacklisted("reddit.com"),
        HostPolicy::blacklisted("www.facebook.com"),
        HostPolicy::blacklisted("facebook.com"),
        HostPolicy::cooldown("news.ycombinator.com", 1),
    ]
}

impl ProxyConfig {
    /// Create a new proxy configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file, then the environment
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }

    /// Load configuration from an optional file, then the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ProxyConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ProxyError::Config("max_connections must be positive".to_string()));
        }
        if self.max_head_bytes < 64 {
            return Err(ProxyError::Config("max_head_bytes must be at least 64".to_string()));
        }
        if self.admission.session_capacity == 0 {
            return Err(ProxyError::Config(
                "admission.session_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Upstream connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Request head read timeout
    pub fn head_timeout(&self) -> Duration {
        Duration::from_secs(self.head_timeout)
    }

    /// Create a configuration for local development
    pub fn for_development() -> Self {
        Self {
            db_path: PathBuf::from("dev-data.db"),
            log_level: "debug".to_string(),
            ..Default::default()
        }
    }

    /// Create a configuration for testing
    pub fn for_testing() -> Self {
        Self {
            // Random ports
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            api_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            db_path: PathBuf::from(":memory:"),
            admission: AdmissionConfig {
                session_capacity: 64,
                failure_policy: FailurePolicy::Closed,
            },
            connect_timeout: 2,
            head_timeout: 2,
            max_connections: 16,
            log_level: "debug".to_string(),
            seed: Vec::new(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProxyConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.seed.len(), 5);
        assert!(ProxyConfig::for_testing().seed.is_empty());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
listen_addr = "0.0.0.0:3128"
db_path = "/var/lib/proxycop/data.db"

[admission]
failure_policy = "open"

[[seed]]
hostname = "c.example"
cooldown_minutes = 5

[[seed]]
hostname = "a.example"
blacklisted = true
"#
        )
        .unwrap();

        let config = ProxyConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:3128".parse().unwrap());
        assert_eq!(config.db_path, PathBuf::from("/var/lib/proxycop/data.db"));
        assert_eq!(config.admission.failure_policy, FailurePolicy::Open);
        assert_eq!(config.admission.session_capacity, AdmissionConfig::default().session_capacity);
        assert_eq!(
            config.seed,
            vec![HostPolicy::cooldown("c.example", 5), HostPolicy::blacklisted("a.example")]
        );
        // Unset keys keep their defaults
        assert_eq!(config.api_addr.port(), 8081);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(matches!(
            ProxyConfig::from_file("/nonexistent/proxycop.toml"),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = ProxyConfig { max_connections: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.admission.session_capacity = 0;
        assert!(config.validate().is_err());
    }
}
