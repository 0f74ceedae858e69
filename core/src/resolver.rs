//! Status resolver
//!
//! Combines the cooldown and blacklist engines into one verdict. Cooldown is
//! always checked first: a host that is cooling down reports its remaining
//! time even if it is also blacklisted.
//!
//! [`StatusResolver::resolve`] is the mutating entry point used by live
//! traffic. An `Allowed` outcome arms the host's next cooldown and bumps its
//! visit counter. [`StatusResolver::peek`] and [`StatusResolver::status`]
//! never write.

use crate::blacklist::BlacklistEngine;
use crate::cooldown::CooldownEngine;
use crate::error::Result;
use crate::host::normalize_host;
use crate::schema::visits_key;
use crate::store::PolicyStore;
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Admission verdict for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The host may be visited
    Allowed,

    /// The host was visited too recently
    BlockedByCooldown {
        /// Time until the cooldown lapses
        remaining: Duration,
    },

    /// The host is permanently blocked
    BlockedByBlacklist,
}

impl Verdict {
    /// Whether the verdict blocks the request
    pub fn is_forbidden(&self) -> bool {
        !matches!(self, Verdict::Allowed)
    }

    /// Remaining cooldown in whole seconds, rounded up; zero if not cooling down
    pub fn cooldown_secs(&self) -> u64 {
        match self {
            Verdict::BlockedByCooldown { remaining } => ceil_secs(*remaining),
            _ => 0,
        }
    }

    /// Human-readable explanation for a blocked verdict
    pub fn message(&self, host: &str) -> Option<String> {
        match self {
            Verdict::Allowed => None,
            Verdict::BlockedByCooldown { remaining } => Some(format!(
                "cooldown active for {}, retry in {}",
                host,
                format_remaining(*remaining)
            )),
            Verdict::BlockedByBlacklist => Some(format!("{} is blacklisted", host)),
        }
    }
}

/// Read-only status of a host, as reported by the status API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    /// Whether the host is on the blacklist
    #[serde(rename = "Blacklisted")]
    pub blacklisted: bool,

    /// Seconds of cooldown left, zero if none
    #[serde(rename = "Cooldown")]
    pub cooldown: u64,
}

impl From<Verdict> for HostStatus {
    fn from(verdict: Verdict) -> Self {
        Self {
            blacklisted: verdict == Verdict::BlockedByBlacklist,
            cooldown: verdict.cooldown_secs(),
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Render a duration as `XmYs` or `Ys`, rounding up to the next second
pub fn format_remaining(d: Duration) -> String {
    let secs = ceil_secs(d);
    if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// Ordered composition of the admission engines
#[derive(Debug)]
pub struct StatusResolver {
    store: Arc<PolicyStore>,
    cooldown: CooldownEngine,
    blacklist: BlacklistEngine,
}

impl StatusResolver {
    /// Create a resolver over the given engines
    pub fn new(store: Arc<PolicyStore>, cooldown: CooldownEngine, blacklist: BlacklistEngine) -> Self {
        Self {
            store,
            cooldown,
            blacklist,
        }
    }

    /// Cooldown engine
    pub fn cooldown(&self) -> &CooldownEngine {
        &self.cooldown
    }

    /// Blacklist engine
    pub fn blacklist(&self) -> &BlacklistEngine {
        &self.blacklist
    }

    /// Evaluate `host` for live traffic.
    ///
    /// On `Allowed`, arms the next cooldown and increments the visit counter.
    pub fn resolve(&self, host: &str) -> Result<Verdict> {
        let host = normalize_host(host)?;

        let verdict = self.evaluate(&host)?;
        if verdict == Verdict::Allowed {
            let (_, visits) = self
                .cooldown
                .start_cooldown_counting(&host, &visits_key(&host))?;
            debug!("Allowed {} (visit #{})", host, visits);
        } else {
            debug!("Blocked {}: {:?}", host, verdict);
        }

        Ok(verdict)
    }

    /// Evaluate `host` without side effects
    pub fn peek(&self, host: &str) -> Result<Verdict> {
        let host = normalize_host(host)?;
        self.evaluate(&host)
    }

    /// Read-only status of `host`, taken from the same ordered verdict as
    /// live traffic: a host cooling down reports only its cooldown.
    pub fn status(&self, host: &str) -> Result<HostStatus> {
        let host = normalize_host(host)?;
        Ok(HostStatus::from(self.evaluate(&host)?))
    }

    /// Persisted number of allowed visits to `host`
    pub fn visit_count(&self, host: &str) -> Result<u64> {
        let host = normalize_host(host)?;
        let count = match self.store.get(&visits_key(&host))? {
            None => 0,
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!("Invalid visit count [{}] for {}", raw, host);
                0
            }),
        };
        Ok(count)
    }

    fn evaluate(&self, host: &str) -> Result<Verdict> {
        let cooldown = self.cooldown.is_on_cooldown(host)?;
        if cooldown.active {
            return Ok(Verdict::BlockedByCooldown {
                remaining: cooldown.remaining,
            });
        }

        if self.blacklist.is_blacklisted(host) {
            return Ok(Verdict::BlockedByBlacklist);
        }

        Ok(Verdict::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::schema::{cooldown_key, BLACKLIST_KEY};
    use rstest::rstest;
    use tempfile::tempdir;

    fn resolver_with(store: Arc<PolicyStore>) -> StatusResolver {
        let blacklist = BlacklistEngine::load(store.clone()).unwrap();
        let cooldown = CooldownEngine::new(store.clone());
        StatusResolver::new(store, cooldown, blacklist)
    }

    /// blacklist = {a.example, b.example}, c.example cools down for 1 minute
    fn scenario() -> (StatusResolver, Arc<PolicyStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(PolicyStore::open_in_memory_with_clock(clock.clone()).unwrap());
        store.set(BLACKLIST_KEY, "a.example,b.example", None).unwrap();
        CooldownEngine::new(store.clone())
            .set_cooldown_minutes("c.example", 1)
            .unwrap();
        (resolver_with(store.clone()), store, clock)
    }

    #[test]
    fn test_scenario() {
        let (resolver, store, _) = scenario();

        assert_eq!(resolver.resolve("a.example").unwrap(), Verdict::BlockedByBlacklist);
        assert_eq!(resolver.resolve("b.example").unwrap(), Verdict::BlockedByBlacklist);

        assert_eq!(resolver.resolve("c.example").unwrap(), Verdict::Allowed);
        assert_eq!(
            resolver.resolve("c.example").unwrap(),
            Verdict::BlockedByCooldown { remaining: Duration::from_secs(60) }
        );

        assert_eq!(resolver.resolve("d.example").unwrap(), Verdict::Allowed);
        assert_eq!(store.get(&cooldown_key("d.example")).unwrap(), None);
        assert_eq!(resolver.resolve("d.example").unwrap(), Verdict::Allowed);
    }

    #[test]
    fn test_cooldown_takes_precedence_over_blacklist() {
        let (resolver, store, _) = scenario();
        store
            .set(&cooldown_key("a.example"), "1", Some(Duration::from_secs(30)))
            .unwrap();

        assert_eq!(
            resolver.resolve("a.example").unwrap(),
            Verdict::BlockedByCooldown { remaining: Duration::from_secs(30) }
        );
    }

    #[test]
    fn test_cooldown_lapses_and_rearms() {
        let (resolver, _, clock) = scenario();
        assert_eq!(resolver.resolve("c.example").unwrap(), Verdict::Allowed);

        clock.advance(Duration::from_secs(60));
        assert_eq!(resolver.resolve("c.example").unwrap(), Verdict::Allowed);
        assert!(resolver.resolve("c.example").unwrap().is_forbidden());
    }

    #[test]
    fn test_blocked_resolution_has_no_side_effects() {
        let (resolver, _, _) = scenario();
        resolver.resolve("a.example").unwrap();
        assert_eq!(resolver.visit_count("a.example").unwrap(), 0);

        resolver.resolve("c.example").unwrap();
        resolver.resolve("c.example").unwrap();
        assert_eq!(resolver.visit_count("c.example").unwrap(), 1);
    }

    #[test]
    fn test_hostnames_are_case_folded() {
        let (resolver, _, _) = scenario();
        assert_eq!(resolver.resolve("A.Example").unwrap(), Verdict::BlockedByBlacklist);
        assert_eq!(resolver.resolve("C.EXAMPLE.").unwrap(), Verdict::Allowed);
        assert!(resolver.resolve("c.example").unwrap().is_forbidden());
    }

    #[test]
    fn test_invalid_host_is_an_error() {
        let (resolver, _, _) = scenario();
        assert!(resolver.resolve("").is_err());
        assert!(resolver.status("bad host").is_err());
    }

    #[test]
    fn test_peek_and_status_do_not_arm() {
        let (resolver, store, _) = scenario();

        assert_eq!(resolver.peek("c.example").unwrap(), Verdict::Allowed);
        assert_eq!(
            resolver.status("c.example").unwrap(),
            HostStatus { blacklisted: false, cooldown: 0 }
        );
        assert_eq!(store.get(&cooldown_key("c.example")).unwrap(), None);
        assert_eq!(resolver.visit_count("c.example").unwrap(), 0);

        resolver.resolve("c.example").unwrap();
        assert_eq!(
            resolver.status("c.example").unwrap(),
            HostStatus { blacklisted: false, cooldown: 60 }
        );
    }

    #[test]
    fn test_status_follows_cooldown_first_order() {
        let (resolver, store, clock) = scenario();
        store
            .set(&cooldown_key("a.example"), "1", Some(Duration::from_millis(1500)))
            .unwrap();

        assert_eq!(
            resolver.status("a.example").unwrap(),
            HostStatus { blacklisted: false, cooldown: 2 }
        );

        clock.advance(Duration::from_secs(2));
        assert_eq!(
            resolver.status("a.example").unwrap(),
            HostStatus { blacklisted: true, cooldown: 0 }
        );
    }

    #[test]
    fn test_status_agrees_with_verdict_after_blacklisting() {
        let (resolver, _, _) = scenario();
        assert_eq!(resolver.resolve("c.example").unwrap(), Verdict::Allowed);
        resolver.blacklist().set_membership("c.example", true).unwrap();

        let verdict = resolver.peek("c.example").unwrap();
        assert_eq!(verdict, Verdict::BlockedByCooldown { remaining: Duration::from_secs(60) });
        assert_eq!(
            resolver.status("c.example").unwrap(),
            HostStatus { blacklisted: false, cooldown: 60 }
        );
    }

    #[test]
    fn test_failed_visit_count_leaves_no_cooldown() {
        let (resolver, store, _) = scenario();
        store
            .execute_raw(
                "CREATE TRIGGER fail_visits BEFORE INSERT ON kv
                 WHEN NEW.key = 'v1:host:c.example:visits'
                 BEGIN SELECT RAISE(ABORT, 'counter write failed'); END;",
            )
            .unwrap();

        assert!(resolver.resolve("c.example").is_err());
        assert_eq!(store.get(&cooldown_key("c.example")).unwrap(), None);
        assert_eq!(resolver.peek("c.example").unwrap(), Verdict::Allowed);
    }

    #[test]
    fn test_status_json_shape() {
        let status = HostStatus { blacklisted: true, cooldown: 0 };
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"Blacklisted":true,"Cooldown":0}"#
        );
    }

    #[test]
    fn test_visit_counter_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");

        let store = Arc::new(PolicyStore::open(&path).unwrap());
        let resolver = resolver_with(store.clone());
        for _ in 0..5 {
            assert_eq!(resolver.resolve("d.example").unwrap(), Verdict::Allowed);
        }
        assert_eq!(resolver.visit_count("d.example").unwrap(), 5);
        drop(resolver);
        Arc::try_unwrap(store).unwrap().close().unwrap();

        let store = Arc::new(PolicyStore::open(&path).unwrap());
        let resolver = resolver_with(store);
        assert_eq!(resolver.visit_count("d.example").unwrap(), 5);
        resolver.resolve("d.example").unwrap();
        assert_eq!(resolver.visit_count("d.example").unwrap(), 6);
    }

    #[rstest]
    #[case(Duration::from_secs(0), "0s")]
    #[case(Duration::from_millis(200), "1s")]
    #[case(Duration::from_secs(59), "59s")]
    #[case(Duration::from_secs(60), "1m0s")]
    #[case(Duration::from_millis(65_500), "1m6s")]
    fn test_format_remaining(#[case] d: Duration, #[case] expected: &str) {
        assert_eq!(format_remaining(d), expected);
    }

    #[test]
    fn test_messages() {
        assert_eq!(Verdict::Allowed.message("x.example"), None);
        assert_eq!(
            Verdict::BlockedByBlacklist.message("x.example").unwrap(),
            "x.example is blacklisted"
        );
        assert_eq!(
            Verdict::BlockedByCooldown { remaining: Duration::from_secs(59) }
                .message("x.example")
                .unwrap(),
            "cooldown active for x.example, retry in 59s"
        );
    }
}
