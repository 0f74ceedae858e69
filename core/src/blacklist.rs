//! Blacklist engine
//!
//! The persisted blacklist is one comma-delimited value. It is parsed into a
//! set when loaded and only re-parsed on an explicit reload or edit, so a
//! membership check never touches the store.

use crate::error::Result;
use crate::host::normalize_host;
use crate::schema::{BLACKLIST_DELIMITER, BLACKLIST_KEY};
use crate::store::PolicyStore;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

/// Parsed set of permanently blocked hosts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    hosts: HashSet<String>,
}

impl Blacklist {
    /// Parse a delimited host list. Blank and invalid entries are skipped.
    pub fn parse(value: &str) -> Self {
        let hosts = value
            .split(BLACKLIST_DELIMITER)
            .filter(|entry| !entry.trim().is_empty())
            .filter_map(|entry| match normalize_host(entry) {
                Ok(host) => Some(host),
                Err(e) => {
                    warn!("Skipping blacklist entry: {}", e);
                    None
                }
            })
            .collect();
        Self { hosts }
    }

    /// Build from individual hostnames, skipping invalid ones
    pub fn from_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .filter_map(|h| normalize_host(h.as_ref()).ok())
            .collect();
        Self { hosts }
    }

    /// Membership test; unusable hostnames are never blacklisted
    pub fn contains(&self, host: &str) -> bool {
        match normalize_host(host) {
            Ok(host) => self.hosts.contains(&host),
            Err(_) => false,
        }
    }

    /// Number of blocked hosts
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether nothing is blocked
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Hosts in sorted order
    pub fn hosts(&self) -> Vec<String> {
        self.hosts.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
    }

    /// Persisted form: sorted, comma-delimited
    pub fn to_value(&self) -> String {
        let delimiter = BLACKLIST_DELIMITER.to_string();
        self.hosts().join(delimiter.as_str())
    }
}

/// Blacklist engine backed by the policy store
#[derive(Debug)]
pub struct BlacklistEngine {
    store: Arc<PolicyStore>,
    current: RwLock<Arc<Blacklist>>,
}

impl BlacklistEngine {
    /// Load the persisted blacklist. A store with no blacklist blocks nothing.
    pub fn load(store: Arc<PolicyStore>) -> Result<Self> {
        let blacklist = Self::read(&store)?;
        info!("Loaded blacklist with {} hosts", blacklist.len());
        Ok(Self {
            store,
            current: RwLock::new(Arc::new(blacklist)),
        })
    }

    fn read(store: &PolicyStore) -> Result<Blacklist> {
        Ok(store
            .get(BLACKLIST_KEY)?
            .map(|value| Blacklist::parse(&value))
            .unwrap_or_default())
    }

    /// Whether `host` is permanently blocked
    pub fn is_blacklisted(&self, host: &str) -> bool {
        self.snapshot().contains(host)
    }

    /// Current parsed blacklist
    pub fn snapshot(&self) -> Arc<Blacklist> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Re-read the persisted value
    pub fn reload(&self) -> Result<()> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let blacklist = Self::read(&self.store)?;
        debug!("Reloaded blacklist with {} hosts", blacklist.len());
        *current = Arc::new(blacklist);
        Ok(())
    }

    /// Persist a new blacklist and swap it in
    pub fn replace(&self, blacklist: Blacklist) -> Result<()> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        self.store.set(BLACKLIST_KEY, &blacklist.to_value(), None)?;
        info!("Blacklist replaced, {} hosts", blacklist.len());
        *current = Arc::new(blacklist);
        Ok(())
    }

    /// Add or remove one host. `host` must already be normalized.
    pub fn set_membership(&self, host: &str, blacklisted: bool) -> Result<()> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.hosts.contains(host) == blacklisted {
            return Ok(());
        }

        let mut next = (**current).clone();
        if blacklisted {
            next.hosts.insert(host.to_string());
        } else {
            next.hosts.remove(host);
        }

        self.store.set(BLACKLIST_KEY, &next.to_value(), None)?;
        debug!("Blacklist membership for {} set to {}", host, blacklisted);
        *current = Arc::new(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_and_skips_blanks() {
        let list = Blacklist::parse("www.Reddit.com, reddit.com,,facebook.com.,  ");
        assert_eq!(list.len(), 3);
        assert!(list.contains("www.reddit.com"));
        assert!(list.contains("REDDIT.COM"));
        assert!(list.contains("facebook.com"));
        assert!(!list.contains("www.facebook.com"));
    }

    #[test]
    fn test_empty_value_blocks_nothing() {
        let list = Blacklist::parse("");
        assert!(list.is_empty());
        assert!(!list.contains("a.example"));
        assert!(!list.contains(""));
    }

    #[test]
    fn test_exact_match_only() {
        let list = Blacklist::parse("reddit.com");
        assert!(!list.contains("old.reddit.com"));
        assert!(!list.contains("reddit.com.evil.example"));
    }

    #[test]
    fn test_to_value_is_sorted() {
        let list = Blacklist::from_hosts(["b.example", "a.example"]);
        assert_eq!(list.to_value(), "a.example,b.example");
        assert_eq!(Blacklist::parse(&list.to_value()), list);
    }

    #[test]
    fn test_engine_on_empty_store() {
        let store = Arc::new(PolicyStore::open_in_memory().unwrap());
        let engine = BlacklistEngine::load(store).unwrap();
        assert!(!engine.is_blacklisted("a.example"));
    }

    #[test]
    fn test_engine_parses_once_until_reload() {
        let store = Arc::new(PolicyStore::open_in_memory().unwrap());
        store.set(BLACKLIST_KEY, "a.example", None).unwrap();
        let engine = BlacklistEngine::load(store.clone()).unwrap();
        assert!(engine.is_blacklisted("a.example"));

        // Out-of-band edit is not visible until reload
        store.set(BLACKLIST_KEY, "b.example", None).unwrap();
        assert!(engine.is_blacklisted("a.example"));
        assert!(!engine.is_blacklisted("b.example"));

        engine.reload().unwrap();
        assert!(!engine.is_blacklisted("a.example"));
        assert!(engine.is_blacklisted("b.example"));
    }

    #[test]
    fn test_engine_membership_edits_persist() {
        let store = Arc::new(PolicyStore::open_in_memory().unwrap());
        let engine = BlacklistEngine::load(store.clone()).unwrap();

        engine.set_membership("a.example", true).unwrap();
        engine.set_membership("b.example", true).unwrap();
        engine.set_membership("a.example", false).unwrap();

        assert!(!engine.is_blacklisted("a.example"));
        assert!(engine.is_blacklisted("b.example"));
        assert_eq!(store.get(BLACKLIST_KEY).unwrap().as_deref(), Some("b.example"));

        engine.replace(Blacklist::from_hosts(["c.example"])).unwrap();
        assert_eq!(engine.snapshot().hosts(), vec!["c.example".to_string()]);
    }
}
