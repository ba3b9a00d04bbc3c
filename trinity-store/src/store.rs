//! Store handle and schema migrations
//!
//! A single pooled connection behind a mutex; every public method runs a
//! short transaction or a single statement. The baseline schema is
//! idempotent (`CREATE TABLE IF NOT EXISTS`); anything after version 1 is
//! an ALTER-only forward migration keyed by the `schema_migrations` row.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

/// Latest schema version; bump alongside a new entry in `MIGRATIONS`
const SCHEMA_VERSION: i64 = 2;

/// ALTER-only migrations, index 0 upgrading version 1 → 2 and so on
const MIGRATIONS: &[&str] = &[
    // v1 -> v2: read-only mode grew glob pattern configuration
    "ALTER TABLE agents ADD COLUMN read_only_patterns TEXT;",
];

/// Errors from state-store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("stored value corrupt: {0}")]
    Corrupt(String),

    #[error("password hashing failed: {0}")]
    Password(String),
}

impl From<StoreError> for trinity_core::Error {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the embedded state store
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (or create) the store at `path` and migrate it forward
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("create db dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute_batch(include_str!("schema.sql"))?;

        let version: i64 = conn
            .query_row("SELECT version FROM schema_migrations LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        if version == 0 {
            conn.execute("INSERT INTO schema_migrations (version) VALUES (1)", [])?;
        }
        let mut version = version.max(1);

        while version < SCHEMA_VERSION {
            let migration = MIGRATIONS[(version - 1) as usize];
            tracing::info!(from = version, to = version + 1, "applying store migration");
            conn.execute_batch(migration)?;
            version += 1;
            conn.execute("UPDATE schema_migrations SET version = ?1", [version])?;
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }
}

/// Serialize a timestamp for storage
///
/// Millisecond precision with a `Z` suffix, the ISO-8601 subset
/// SQLite's date functions parse.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse a stored timestamp
pub(crate) fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

/// Parse an optional stored timestamp
pub(crate) fn parse_opt_ts(raw: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trinity.db");
        let store = StateStore::open(&path).unwrap();
        drop(store);
        assert!(path.exists());

        // Re-opening runs migrations again without complaint
        let store = StateStore::open(&path).unwrap();
        let version: i64 = store
            .lock()
            .query_row("SELECT version FROM schema_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migration_added_pattern_column() {
        let store = StateStore::open_in_memory().unwrap();
        // The v2 column is queryable on a fresh database
        store
            .lock()
            .query_row("SELECT read_only_patterns FROM agents LIMIT 1", [], |_| Ok(()))
            .ok();
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
        assert!(parse_ts("not a time").is_err());
        assert_eq!(parse_opt_ts(None).unwrap(), None);
    }
}
