//! Persisted key schema
//!
//! All policy state lives under one versioned key layout. Hostnames passed
//! to the key builders must already be normalized.

/// Version of the key layout written by this build
pub const SCHEMA_VERSION: u32 = 1;

/// Key holding the schema version of the store
pub const SCHEMA_VERSION_KEY: &str = "meta:schema_version";

/// Key holding the comma-delimited blacklist
pub const BLACKLIST_KEY: &str = "v1:config:blacklist";

/// Delimiter between hostnames in the blacklist value
pub const BLACKLIST_DELIMITER: char = ',';

/// Prefix shared by every per-host key
const HOST_PREFIX: &str = "v1:host:";

/// Configured cooldown duration for a host, in minutes
pub fn cooldown_minutes_key(host: &str) -> String {
    format!("{}{}:cooldown_minutes", HOST_PREFIX, host)
}

/// Live cooldown marker for a host; carries a TTL
pub fn cooldown_key(host: &str) -> String {
    format!("{}{}:cooldown", HOST_PREFIX, host)
}

/// Visit counter for a host
pub fn visits_key(host: &str) -> String {
    format!("{}{}:visits", HOST_PREFIX, host)
}

/// Extract the host from a `cooldown_minutes` key
pub fn host_from_cooldown_minutes_key(key: &str) -> Option<&str> {
    key.strip_prefix(HOST_PREFIX)?.strip_suffix(":cooldown_minutes")
}

/// Prefix used to scan every configured cooldown duration
pub fn cooldown_minutes_scan_prefix() -> &'static str {
    HOST_PREFIX
}
