//! Admission controller
//!
//! The controller owns the policy store, the resolver and the session
//! decision cache. It is built once at startup and shared by reference
//! (`Arc`) with the proxy and the status API.

use crate::blacklist::{Blacklist, BlacklistEngine};
use crate::cooldown::{parse_cooldown_minutes, CooldownEngine};
use crate::error::{to_config_error, PolicyError, Result};
use crate::host::normalize_host;
use crate::resolver::{HostStatus, StatusResolver, Verdict};
use crate::schema::{cooldown_minutes_scan_prefix, host_from_cooldown_minutes_key};
use crate::session::{DecisionCache, SessionDecision, SessionId, DEFAULT_SESSION_CAPACITY};
use crate::store::PolicyStore;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Message used when the store fails and the failure policy blocks
pub const STORE_UNAVAILABLE_MESSAGE: &str = "policy store unavailable";

/// What to do with a connection when its decision cannot be computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Block the connection
    #[default]
    Closed,

    /// Let the connection through
    Open,
}

impl std::str::FromStr for FailurePolicy {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "closed" => Ok(FailurePolicy::Closed),
            "open" => Ok(FailurePolicy::Open),
            other => Err(to_config_error(format_args!(
                "Unknown failure policy {:?}, expected \"closed\" or \"open\"",
                other
            ))),
        }
    }
}

/// Controller settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum number of cached session decisions
    pub session_capacity: usize,

    /// Behavior on storage failure during a live decision
    pub failure_policy: FailurePolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            session_capacity: DEFAULT_SESSION_CAPACITY,
            failure_policy: FailurePolicy::Closed,
        }
    }
}

/// Administrator policy for one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPolicy {
    /// Hostname the policy applies to
    pub hostname: String,

    /// Revisit delay in minutes; zero disables the cooldown
    #[serde(default)]
    pub cooldown_minutes: u32,

    /// Whether the host is permanently blocked
    #[serde(default)]
    pub blacklisted: bool,
}

impl HostPolicy {
    /// A policy with only a cooldown
    pub fn cooldown(hostname: impl Into<String>, minutes: u32) -> Self {
        Self {
            hostname: hostname.into(),
            cooldown_minutes: minutes,
            blacklisted: false,
        }
    }

    /// A blacklisted host without cooldown
    pub fn blacklisted(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            cooldown_minutes: 0,
            blacklisted: true,
        }
    }
}

/// Decision hook consumed by the interception layer
pub trait InterceptionHook: Send + Sync {
    /// Whether the connection `session`, targeting `host`, must be
    /// intercepted and answered with a blocked response
    fn should_intercept(&self, session: SessionId, host: &str) -> bool;

    /// Blocked-page text for an intercepted session
    fn blocked_message(&self, session: SessionId) -> Option<String>;

    /// The connection behind `session` has closed
    fn connection_closed(&self, session: SessionId);
}

/// Process-wide admission state
#[derive(Debug)]
pub struct AdmissionController {
    store: Arc<PolicyStore>,
    resolver: StatusResolver,
    sessions: DecisionCache,
    failure_policy: FailurePolicy,
}

impl AdmissionController {
    /// Build a controller over an open store
    pub fn new(store: Arc<PolicyStore>, config: AdmissionConfig) -> Result<Self> {
        let blacklist = BlacklistEngine::load(store.clone())?;
        let cooldown = CooldownEngine::new(store.clone());
        let resolver = StatusResolver::new(store.clone(), cooldown, blacklist);

        Ok(Self {
            store,
            resolver,
            sessions: DecisionCache::new(config.session_capacity),
            failure_policy: config.failure_policy,
        })
    }

    /// Open the store file at `path` and build a controller over it
    pub fn open(path: impl AsRef<Path>, config: AdmissionConfig) -> Result<Self> {
        let store = Arc::new(PolicyStore::open(path)?);
        Self::new(store, config)
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Underlying resolver
    pub fn resolver(&self) -> &StatusResolver {
        &self.resolver
    }

    /// Session decision cache
    pub fn sessions(&self) -> &DecisionCache {
        &self.sessions
    }

    /// Failure policy in force
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Admission decision for a connection.
    ///
    /// The first call for `session` resolves `host`; every later call returns
    /// that same decision, whatever host it names.
    pub fn decide(&self, session: SessionId, host: &str) -> SessionDecision {
        self.sessions.get_or_decide(session, || {
            let decision = match self.resolver.resolve(host) {
                Ok(verdict) => Self::translate(verdict, host),
                Err(PolicyError::InvalidHost(raw)) => {
                    debug!("Session {} named an invalid host {:?}", session, raw);
                    SessionDecision::Forbidden {
                        message: format!("invalid host {:?}", raw),
                    }
                }
                Err(e) => {
                    error!("Resolving {} for session {} failed: {}", host, session, e);
                    self.on_failure()
                }
            };
            debug!("Session {} -> {} decided {:?}", session, host, decision);
            decision
        })
    }

    fn translate(verdict: Verdict, host: &str) -> SessionDecision {
        match verdict.message(host.trim()) {
            None => SessionDecision::Allowed,
            Some(message) => SessionDecision::Forbidden { message },
        }
    }

    fn on_failure(&self) -> SessionDecision {
        match self.failure_policy {
            FailurePolicy::Closed => SessionDecision::Forbidden {
                message: STORE_UNAVAILABLE_MESSAGE.to_string(),
            },
            FailurePolicy::Open => SessionDecision::Allowed,
        }
    }

    /// Forget the decision of a closed connection
    pub fn end_session(&self, session: SessionId) {
        if self.sessions.forget(session).is_some() {
            debug!("Session {} closed", session);
        }
    }

    /// Read-only status of `host`
    pub fn status(&self, host: &str) -> Result<HostStatus> {
        self.resolver.status(host)
    }

    /// Persisted visit count of `host`
    pub fn visit_count(&self, host: &str) -> Result<u64> {
        self.resolver.visit_count(host)
    }

    /// Current policy of `host`
    pub fn policy(&self, host: &str) -> Result<HostPolicy> {
        let hostname = normalize_host(host)?;
        let cooldown_minutes = self
            .resolver
            .cooldown()
            .configured_minutes(&hostname)?
            .unwrap_or(0);
        let blacklisted = self.resolver.blacklist().is_blacklisted(&hostname);
        Ok(HostPolicy {
            hostname,
            cooldown_minutes,
            blacklisted,
        })
    }

    /// Every host with a cooldown configured or a blacklist entry, by name
    pub fn policies(&self) -> Result<Vec<HostPolicy>> {
        let mut policies: BTreeMap<String, HostPolicy> = BTreeMap::new();

        for (key, raw) in self.store.scan_prefix(cooldown_minutes_scan_prefix())? {
            let Some(host) = host_from_cooldown_minutes_key(&key) else {
                continue;
            };
            if let Some(minutes) = parse_cooldown_minutes(host, &raw) {
                policies.insert(host.to_string(), HostPolicy::cooldown(host, minutes));
            }
        }

        for host in self.resolver.blacklist().snapshot().hosts() {
            policies
                .entry(host.clone())
                .or_insert_with(|| HostPolicy::cooldown(host, 0))
                .blacklisted = true;
        }

        Ok(policies.into_values().collect())
    }

    /// Store `policy`, replacing the host's previous cooldown and blacklist
    /// settings. A cooldown that is already running is left to expire.
    pub fn apply_policy(&self, policy: &HostPolicy) -> Result<HostPolicy> {
        let hostname = normalize_host(&policy.hostname)?;
        self.resolver
            .cooldown()
            .set_cooldown_minutes(&hostname, policy.cooldown_minutes)?;
        self.resolver
            .blacklist()
            .set_membership(&hostname, policy.blacklisted)?;

        info!(
            "Policy for {}: cooldown {} min, blacklisted {}",
            hostname, policy.cooldown_minutes, policy.blacklisted
        );
        Ok(HostPolicy {
            hostname,
            cooldown_minutes: policy.cooldown_minutes,
            blacklisted: policy.blacklisted,
        })
    }

    /// Apply a batch of startup policies
    pub fn seed(&self, policies: &[HostPolicy]) -> Result<()> {
        for policy in policies {
            self.apply_policy(policy)?;
        }
        if !policies.is_empty() {
            info!("Seeded {} host policies", policies.len());
        }
        Ok(())
    }

    /// Blacklisted hosts, sorted
    pub fn blacklist(&self) -> Vec<String> {
        self.resolver.blacklist().snapshot().hosts()
    }

    /// Replace the whole blacklist
    pub fn replace_blacklist<I, S>(&self, hosts: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.resolver.blacklist().replace(Blacklist::from_hosts(hosts))
    }

    /// Re-read the persisted blacklist
    pub fn reload_blacklist(&self) -> Result<()> {
        self.resolver.blacklist().reload()
    }

    /// Drop in-memory state and close the store.
    ///
    /// If someone else still holds the store, it is closed when they let go.
    pub fn close(self) -> Result<()> {
        let Self {
            store,
            resolver,
            sessions,
            ..
        } = self;
        drop(resolver);
        drop(sessions);

        match Arc::try_unwrap(store) {
            Ok(store) => store.close(),
            Err(_) => {
                warn!("Policy store still in use, closing it on drop");
                Ok(())
            }
        }
    }
}

impl InterceptionHook for AdmissionController {
    fn should_intercept(&self, session: SessionId, host: &str) -> bool {
        self.decide(session, host).is_forbidden()
    }

    fn blocked_message(&self, session: SessionId) -> Option<String> {
        self.sessions
            .get(session)
            .and_then(|decision| decision.message().map(str::to_string))
    }

    fn connection_closed(&self, session: SessionId) {
        self.end_session(session);
    }
}
