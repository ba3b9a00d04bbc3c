//! MCP API key rows
//!
//! Tokens are stored as SHA-256 hashes plus a short display prefix;
//! validation resolves a presented token to the (user, agent, scope)
//! triple downstream checks need.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use trinity_core::token;
use trinity_core::types::{McpIdentity, McpKey, McpScope};
use uuid::Uuid;

use crate::store::{parse_ts, ts, StateStore, StoreError, StoreResult};

fn scope_from_str(raw: &str) -> StoreResult<McpScope> {
    match raw {
        "user" => Ok(McpScope::User),
        "system" => Ok(McpScope::System),
        other => Err(StoreError::Corrupt(format!("unknown key scope '{other}'"))),
    }
}

const COLS: &str =
    "id, token_prefix, owner_username, agent_name, scope, description, created_at, revoked";

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<(McpKey, String, String)> {
    Ok((
        McpKey {
            id: row.get(0)?,
            token_prefix: row.get(1)?,
            owner_username: row.get(2)?,
            agent_name: row.get(3)?,
            scope: McpScope::User,
            description: row.get(5)?,
            created_at: Utc::now(),
            revoked: row.get(7)?,
        },
        row.get::<_, String>(4)?,
        row.get::<_, String>(6)?,
    ))
}

fn finish(parts: (McpKey, String, String)) -> StoreResult<McpKey> {
    let (mut key, scope_raw, created_raw) = parts;
    key.scope = scope_from_str(&scope_raw)?;
    key.created_at = parse_ts(&created_raw)?;
    Ok(key)
}

impl StateStore {
    /// Mint and store a new MCP key
    ///
    /// Returns the key metadata together with the full token; the token
    /// is not recoverable afterwards.
    pub fn create_mcp_key(
        &self,
        owner_username: &str,
        agent_name: Option<&str>,
        scope: McpScope,
        description: Option<&str>,
    ) -> StoreResult<(McpKey, String)> {
        let minted = token::mint();
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO mcp_api_keys
                     (id, token_hash, token_prefix, owner_username, agent_name, scope,
                      description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    minted.token_hash,
                    minted.display_prefix,
                    owner_username,
                    agent_name,
                    scope.as_str(),
                    description,
                    ts(created_at),
                ],
            )?;
        }
        let key = McpKey {
            id,
            token_prefix: minted.display_prefix,
            owner_username: owner_username.to_string(),
            agent_name: agent_name.map(str::to_string),
            scope,
            description: description.map(str::to_string),
            created_at,
            revoked: false,
        };
        Ok((key, minted.token))
    }

    /// Resolve a presented bearer token, rejecting revoked keys
    pub fn validate_mcp_token(&self, presented: &str) -> StoreResult<Option<McpIdentity>> {
        if !token::looks_like_token(presented) {
            return Ok(None);
        }
        let hash = token::hash(presented);
        let conn = self.lock();
        let found = conn
            .query_row(
                "SELECT owner_username, agent_name, scope FROM mcp_api_keys
                 WHERE token_hash = ?1 AND revoked = 0",
                params![hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        found
            .map(|(username, agent_name, scope_raw)| {
                Ok(McpIdentity {
                    username,
                    agent_name,
                    scope: scope_from_str(&scope_raw)?,
                })
            })
            .transpose()
    }

    /// Keys owned by a user, newest first
    pub fn list_mcp_keys(&self, owner_username: &str) -> StoreResult<Vec<McpKey>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM mcp_api_keys WHERE owner_username = ?1
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt
            .query_map(params![owner_username], row_to_key)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish).collect()
    }

    /// Mark a key revoked; scoped to its owner
    pub fn revoke_mcp_key(&self, id: &str, owner_username: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE mcp_api_keys SET revoked = 1 WHERE id = ?1 AND owner_username = ?2",
            params![id, owner_username],
        )?;
        Ok(n > 0)
    }

    /// Delete all keys scoped to an agent (lifecycle tear-down)
    pub fn delete_agent_mcp_keys(&self, agent_name: &str) -> StoreResult<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM mcp_api_keys WHERE agent_name = ?1",
            params![agent_name],
        )?;
        Ok(n)
    }

    /// Is there a live system-scoped key for this agent?
    pub fn has_system_mcp_key(&self, agent_name: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mcp_api_keys
             WHERE agent_name = ?1 AND scope = 'system' AND revoked = 0",
            params![agent_name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
