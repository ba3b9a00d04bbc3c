//! Agent ownership rows and mode flags
//!
//! The container engine's labels are the agent index; these rows carry
//! only what labels cannot: ownership, the system flag and mode toggles.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use trinity_core::types::{AgentRecord, ReadOnlyConfig};

use crate::store::{parse_ts, ts, StateStore, StoreError, StoreResult};

const RECORD_COLS: &str = "name, owner_username, is_system, autonomy_enabled, read_only_mode, \
                           use_platform_api_key, created_at";

impl StateStore {
    /// Register (or re-assert) ownership of an agent
    ///
    /// Idempotent: an existing row keeps its creation time and flags but
    /// adopts the given owner and system flag, so boot can repair a
    /// system-agent row that lost its flag.
    pub fn register_agent_owner(
        &self,
        name: &str,
        owner_username: &str,
        is_system: bool,
    ) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO agents (name, owner_username, is_system, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 owner_username = excluded.owner_username,
                 is_system = excluded.is_system",
            params![name, owner_username, is_system, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Fetch one agent's ownership row
    pub fn get_agent_record(&self, name: &str) -> StoreResult<Option<AgentRecord>> {
        let conn = self.lock();
        let found = conn
            .query_row(
                &format!("SELECT {RECORD_COLS} FROM agents WHERE name = ?1"),
                params![name],
                |row| {
                    Ok((
                        AgentRecord {
                            name: row.get(0)?,
                            owner_username: row.get(1)?,
                            is_system: row.get(2)?,
                            autonomy_enabled: row.get(3)?,
                            read_only_mode: row.get(4)?,
                            use_platform_api_key: row.get(5)?,
                            created_at: Utc::now(),
                        },
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        match found {
            Some((mut record, created_raw)) => {
                record.created_at = parse_ts(&created_raw)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Owner username of an agent, if registered
    pub fn get_agent_owner(&self, name: &str) -> StoreResult<Option<String>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT owner_username FROM agents WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// All agent names owned by a user
    pub fn list_agents_owned_by(&self, owner_username: &str) -> StoreResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT name FROM agents WHERE owner_username = ?1 ORDER BY name")?;
        let names = stmt
            .query_map(params![owner_username], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// All registered agent names
    pub fn list_registered_agents(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT name FROM agents ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Delete an agent row; permissions and schedules cascade
    ///
    /// Returns whether a row existed. Refuses system agents.
    pub fn delete_agent_record(&self, name: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let is_system: Option<bool> = conn
            .query_row(
                "SELECT is_system FROM agents WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match is_system {
            None => Ok(false),
            Some(true) => Err(StoreError::Corrupt(format!(
                "refusing to delete system agent '{name}'"
            ))),
            Some(false) => {
                conn.execute("DELETE FROM agents WHERE name = ?1", params![name])?;
                Ok(true)
            }
        }
    }

    /// Flip the autonomy flag; the scheduler consults this per tick
    pub fn set_autonomy_enabled(&self, name: &str, enabled: bool) -> StoreResult<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE agents SET autonomy_enabled = ?2 WHERE name = ?1",
            params![name, enabled],
        )?;
        Ok(n > 0)
    }

    /// Flip the platform-API-key flag
    pub fn set_use_platform_api_key(&self, name: &str, enabled: bool) -> StoreResult<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE agents SET use_platform_api_key = ?2 WHERE name = ?1",
            params![name, enabled],
        )?;
        Ok(n > 0)
    }

    /// Store the read-only mode flag and its glob pattern config
    pub fn set_read_only_config(&self, name: &str, config: &ReadOnlyConfig) -> StoreResult<bool> {
        let conn = self.lock();
        let patterns = serde_json::to_string(config)
            .map_err(|e| StoreError::Corrupt(format!("serialize read-only config: {e}")))?;
        let n = conn.execute(
            "UPDATE agents SET read_only_mode = ?2, read_only_patterns = ?3 WHERE name = ?1",
            params![name, config.enabled, patterns],
        )?;
        Ok(n > 0)
    }

    /// Read-only mode config, defaulting to disabled
    pub fn get_read_only_config(&self, name: &str) -> StoreResult<ReadOnlyConfig> {
        let conn = self.lock();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT read_only_patterns FROM agents WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match raw.flatten() {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| StoreError::Corrupt(format!("read-only config: {e}"))),
            None => Ok(ReadOnlyConfig::default()),
        }
    }
}
