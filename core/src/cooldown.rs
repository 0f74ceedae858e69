//! Cooldown engine
//!
//! A cooldown is a marker key written with a TTL. While the marker is
//! readable the host is blocked; when the TTL runs out the store stops
//! returning it and the host is visitable again.

use crate::error::Result;
use crate::schema::{cooldown_key, cooldown_minutes_key};
use crate::store::{Expiry, PolicyStore};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// Value stored under a live cooldown marker
const COOLDOWN_MARKER: &str = "1";

/// Snapshot of a host's cooldown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownState {
    /// Whether a cooldown is currently in force
    pub active: bool,

    /// Time left; zero when inactive
    pub remaining: Duration,
}

impl CooldownState {
    /// No cooldown in force
    pub const INACTIVE: CooldownState = CooldownState {
        active: false,
        remaining: Duration::ZERO,
    };
}

/// Parse a stored cooldown duration in minutes.
///
/// Zero means disabled. Anything that is not a decimal integer is logged and
/// also treated as disabled.
pub fn parse_cooldown_minutes(host: &str, raw: &str) -> Option<u32> {
    match raw.trim().parse::<u32>() {
        Ok(0) => None,
        Ok(minutes) => Some(minutes),
        Err(_) => {
            warn!("Invalid cooldown time [{}] for {}, treating as disabled", raw, host);
            None
        }
    }
}

/// Cooldown engine backed by the policy store.
///
/// Hostnames passed in must already be normalized.
#[derive(Debug, Clone)]
pub struct CooldownEngine {
    store: Arc<PolicyStore>,
}

impl CooldownEngine {
    /// Create a cooldown engine
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    /// Whether `host` is cooling down, and for how long
    pub fn is_on_cooldown(&self, host: &str) -> Result<CooldownState> {
        let state = match self.store.ttl(&cooldown_key(host))? {
            None => CooldownState::INACTIVE,
            Some(Expiry::In(remaining)) => CooldownState { active: true, remaining },
            Some(Expiry::Never) => {
                // Markers are always written with a TTL; an unbounded one
                // would block forever, so it is ignored.
                warn!("Cooldown marker for {} has no expiry, ignoring", host);
                CooldownState::INACTIVE
            }
        };
        Ok(state)
    }

    /// Configured cooldown duration for `host`, `None` when disabled
    pub fn configured_duration(&self, host: &str) -> Result<Option<Duration>> {
        Ok(self
            .configured_minutes(host)?
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60)))
    }

    /// Configured cooldown minutes for `host`, `None` when disabled
    pub fn configured_minutes(&self, host: &str) -> Result<Option<u32>> {
        Ok(self
            .store
            .get(&cooldown_minutes_key(host))?
            .and_then(|raw| parse_cooldown_minutes(host, &raw)))
    }

    /// Set the configured cooldown for `host`; zero disables it
    pub fn set_cooldown_minutes(&self, host: &str, minutes: u32) -> Result<()> {
        self.store
            .set(&cooldown_minutes_key(host), &minutes.to_string(), None)
    }

    /// Arm a cooldown for `host` using its configured duration.
    ///
    /// No-op when the host has no cooldown configured. Returns the armed
    /// duration.
    pub fn start_cooldown(&self, host: &str) -> Result<Option<Duration>> {
        let duration = match self.configured_duration(host)? {
            Some(duration) => duration,
            None => return Ok(None),
        };

        self.store
            .set(&cooldown_key(host), COOLDOWN_MARKER, Some(duration))?;
        debug!("Cooldown armed for {} ({}s)", host, duration.as_secs());
        Ok(Some(duration))
    }

    /// Arm the configured cooldown for `host` and bump `counter` in one
    /// store transaction. Returns the armed duration and the new count.
    pub fn start_cooldown_counting(
        &self,
        host: &str,
        counter: &str,
    ) -> Result<(Option<Duration>, u64)> {
        let duration = self.configured_duration(host)?;
        let marker_key = cooldown_key(host);
        let count = self.store.increment_with(
            counter,
            duration.map(|d| (marker_key.as_str(), COOLDOWN_MARKER, d)),
        )?;
        if let Some(d) = duration {
            debug!("Cooldown armed for {} ({}s)", host, d.as_secs());
        }
        Ok((duration, count))
    }

    /// Lift an active cooldown early
    pub fn clear(&self, host: &str) -> Result<bool> {
        self.store.delete(&cooldown_key(host))
    }
}
