//! Durable key-value policy store
//!
//! A single SQLite table holds every key with an optional absolute expiry.
//! Expired rows are invisible to reads the moment their deadline passes;
//! nothing needs to sweep them. [`PolicyStore::purge_expired`] only reclaims
//! space and is run once when the store is opened.
//!
//! Missing keys come back as `Ok(None)`. An `Err` always means the storage
//! engine itself failed.

use crate::clock::{Clock, SystemClock};
use crate::error::{PolicyError, Result};
use crate::schema::{SCHEMA_VERSION, SCHEMA_VERSION_KEY};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Remaining lifetime of a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The key was written without a TTL
    Never,

    /// The key becomes unreadable after this long
    In(Duration),
}

impl Expiry {
    /// Remaining duration, or `None` for keys that never expire
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Expiry::Never => None,
            Expiry::In(d) => Some(*d),
        }
    }
}

/// Durable key-value store with per-key TTL
pub struct PolicyStore {
    /// SQLite connection; every call holds the lock for one short statement
    /// or transaction
    conn: Mutex<Connection>,

    /// Time source for expiry
    clock: Arc<dyn Clock>,

    /// Backing file, `None` for in-memory stores
    path: Option<PathBuf>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore").field("path", &self.path).finish()
    }
}

impl PolicyStore {
    /// Open (or create) the store file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    /// Open (or create) the store file at `path` with a custom clock
    pub fn open_with_clock(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("Policy store journal mode: {}", journal_mode);
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self::init(conn, clock, Some(path.to_path_buf()))?;
        info!("Opened policy store at {}", path.display());
        Ok(store)
    }

    /// Open a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_clock(Arc::new(SystemClock))
    }

    /// Open a throwaway in-memory store with a custom clock
    pub fn open_in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, clock, None)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key           TEXT PRIMARY KEY NOT NULL,
                value         TEXT NOT NULL,
                expires_at_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS kv_expires ON kv (expires_at_ms)
                WHERE expires_at_ms IS NOT NULL;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            clock,
            path,
        };

        match store.get(SCHEMA_VERSION_KEY)? {
            None => {
                store.set(SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string(), None)?;
                debug!("Initialized empty policy store at schema version {}", SCHEMA_VERSION);
            }
            Some(found) if found == SCHEMA_VERSION.to_string() => {}
            Some(found) => {
                return Err(PolicyError::SchemaMismatch {
                    found,
                    expected: SCHEMA_VERSION,
                })
            }
        }

        let purged = store.purge_expired()?;
        if purged > 0 {
            debug!("Purged {} expired keys", purged);
        }

        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_unix_ms() as i64
    }

    /// Backing file path, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read a live value
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now_ms();
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM kv
                 WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write a value, replacing any previous one along with its expiry.
    ///
    /// With `ttl`, the key reads as missing at and after `now + ttl`.
    pub fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| self.now_ms().saturating_add(ttl.as_millis() as i64));
        self.conn().execute(
            "INSERT INTO kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at_ms = excluded.expires_at_ms",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    /// Remaining lifetime of a live key
    pub fn ttl(&self, key: &str) -> Result<Option<Expiry>> {
        let now = self.now_ms();
        let expires_at: Option<Option<i64>> = self
            .conn()
            .query_row(
                "SELECT expires_at_ms FROM kv
                 WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;

        Ok(expires_at.map(|expires_at| match expires_at {
            None => Expiry::Never,
            Some(at) => Expiry::In(Duration::from_millis((at - now) as u64)),
        }))
    }

    /// Remove a key; returns whether a live value was removed
    pub fn delete(&self, key: &str) -> Result<bool> {
        let now = self.now_ms();
        let removed = self.conn().execute(
            "DELETE FROM kv
             WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
            params![key, now],
        )?;
        Ok(removed > 0)
    }

    /// Atomically add one to a decimal counter and return the new value.
    ///
    /// A missing counter starts at zero. A counter holding something other
    /// than a decimal is logged and restarted from zero.
    pub fn increment(&self, key: &str) -> Result<u64> {
        self.increment_with(key, None)
    }

    /// Add one to `key` and, in the same transaction, write `marker` as a
    /// `(key, value, ttl)` entry. Either both writes land or neither does.
    pub fn increment_with(&self, key: &str, marker: Option<(&str, &str, Duration)>) -> Result<u64> {
        let now = self.now_ms();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if let Some((marker_key, value, ttl)) = marker {
            tx.execute(
                "INSERT INTO kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at_ms = excluded.expires_at_ms",
                params![marker_key, value, now.saturating_add(ttl.as_millis() as i64)],
            )?;
        }

        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM kv
                 WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;

        let count = match current {
            None => 0,
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                warn!("Invalid counter value [{}] for {}, restarting from zero", raw, key);
                0
            }),
        };
        let next = count.saturating_add(1);

        tx.execute(
            "INSERT INTO kv (key, value, expires_at_ms) VALUES (?1, ?2, NULL)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at_ms = NULL",
            params![key, next.to_string()],
        )?;
        tx.commit()?;

        Ok(next)
    }

    /// All live keys starting with `prefix`, in key order
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let now = self.now_ms();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE substr(key, 1, length(?1)) = ?1
               AND (expires_at_ms IS NULL OR expires_at_ms > ?2)
             ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![prefix, now], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(rows)
    }

    /// Physically delete rows whose expiry has passed
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.now_ms();
        let purged = self.conn().execute(
            "DELETE FROM kv WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            params![now],
        )?;
        Ok(purged)
    }

    /// Run raw SQL against the backing database
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    /// Flush and close the underlying database
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, e)| PolicyError::Storage(e))?;
        if let Some(path) = &self.path {
            info!("Closed policy store at {}", path.display());
        }
        Ok(())
    }
}
