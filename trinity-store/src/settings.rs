//! Key/value platform settings
//!
//! Holds operator-level configuration that is not environment-shaped:
//! the GitHub PAT for template clones, the platform Anthropic API key,
//! the meta prompt injected into agents.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::store::{ts, StateStore, StoreResult};

/// Setting key: GitHub PAT used for template clones
pub const GITHUB_PAT: &str = "github_pat";
/// Setting key: platform-owned Anthropic API key
pub const ANTHROPIC_API_KEY: &str = "anthropic_api_key";
/// Setting key: meta prompt injected into every agent workspace
pub const TRINITY_PROMPT: &str = "trinity_prompt";

impl StateStore {
    /// Read a setting
    pub fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Write a setting, replacing any previous value
    pub fn set_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                           updated_at = excluded.updated_at",
            params![key, value, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Remove a setting
    pub fn delete_setting(&self, key: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_replace_delete() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_setting(GITHUB_PAT).unwrap().is_none());

        store.set_setting(GITHUB_PAT, "ghp_first").unwrap();
        assert_eq!(store.get_setting(GITHUB_PAT).unwrap().unwrap(), "ghp_first");

        store.set_setting(GITHUB_PAT, "ghp_second").unwrap();
        assert_eq!(store.get_setting(GITHUB_PAT).unwrap().unwrap(), "ghp_second");

        assert!(store.delete_setting(GITHUB_PAT).unwrap());
        assert!(!store.delete_setting(GITHUB_PAT).unwrap());
    }
}
