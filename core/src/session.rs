//! Per-connection admission decision cache
//!
//! One intercepted connection may carry several requests. The first request
//! decides for the whole connection; later requests on the same session get
//! the cached decision back verbatim, even when they name another host.
//!
//! The cache is a single LRU map behind one mutex. The lock is held while a
//! missing decision is computed, so concurrent first calls for the same
//! session run the resolver exactly once.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

/// Default number of live sessions kept
pub const DEFAULT_SESSION_CAPACITY: usize = 4096;

/// Opaque identifier of one intercepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cached admission outcome for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecision {
    /// Pass the connection through
    Allowed,

    /// Serve a blocked response carrying `message`
    Forbidden {
        /// Explanation shown to the user
        message: String,
    },
}

impl SessionDecision {
    /// Whether the session is blocked
    pub fn is_forbidden(&self) -> bool {
        matches!(self, SessionDecision::Forbidden { .. })
    }

    /// Blocked-page text, if any
    pub fn message(&self) -> Option<&str> {
        match self {
            SessionDecision::Allowed => None,
            SessionDecision::Forbidden { message } => Some(message),
        }
    }
}

/// Bounded map from session to decision
#[derive(Debug)]
pub struct DecisionCache {
    entries: Mutex<LruCache<SessionId, SessionDecision>>,
}

impl DecisionCache {
    /// Create a cache holding at most `capacity` sessions (minimum one)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached decision for `session`, without computing one
    pub fn get(&self, session: SessionId) -> Option<SessionDecision> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session)
            .cloned()
    }

    /// Return the cached decision for `session`, computing and storing it
    /// with `decide` if there is none.
    ///
    /// `decide` runs with the cache lock held and must not call back into
    /// the cache.
    pub fn get_or_decide<F>(&self, session: SessionId, decide: F) -> SessionDecision
    where
        F: FnOnce() -> SessionDecision,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(decision) = entries.get(&session) {
            return decision.clone();
        }

        let decision = decide();
        entries.put(session, decision.clone());
        decision
    }

    /// Drop the decision for a closed connection
    pub fn forget(&self, session: SessionId) -> Option<SessionDecision> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(&session)
    }

    /// Number of cached sessions
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no sessions are cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached sessions
    pub fn capacity(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cap()
            .get()
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAPACITY)
    }
}
