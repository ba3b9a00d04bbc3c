//! User rows and password verification
//!
//! Passwords are bcrypt hashes, nothing else: rows that do not parse as
//! bcrypt fail verification. `migrate_plaintext_passwords` is the
//! one-time escape hatch for databases predating that rule.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::store::{parse_ts, ts, StateStore, StoreError, StoreResult};

const BCRYPT_COST: u32 = bcrypt::DEFAULT_COST;

/// A platform user
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

impl StateStore {
    /// Create a user with a bcrypt-hashed password
    pub fn create_user(&self, username: &str, password: &str, role: &str) -> StoreResult<User> {
        let hash = bcrypt::hash(password, BCRYPT_COST)
            .map_err(|e| StoreError::Password(e.to_string()))?;
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO users (id, username, password_hash, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, username, hash, role, ts(created_at)],
        )?;
        Ok(User {
            id,
            username: username.to_string(),
            role: role.to_string(),
            created_at,
        })
    }

    /// Fetch a user by name
    pub fn get_user(&self, username: &str) -> StoreResult<Option<User>> {
        let conn = self.lock();
        let found = conn
            .query_row(
                "SELECT id, username, role, created_at FROM users WHERE username = ?1",
                params![username],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        found
            .map(|(id, username, role, created_raw)| {
                Ok(User {
                    id,
                    username,
                    role,
                    created_at: parse_ts(&created_raw)?,
                })
            })
            .transpose()
    }

    /// Verify a password against the stored bcrypt hash
    ///
    /// Unknown users and non-bcrypt rows both verify false.
    pub fn verify_password(&self, username: &str, password: &str) -> StoreResult<bool> {
        let stored: Option<String> = {
            let conn = self.lock();
            conn.query_row(
                "SELECT password_hash FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?
        };
        match stored {
            Some(hash) => Ok(bcrypt::verify(password, &hash).unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Ensure a user exists, creating it with the given password if not
    pub fn ensure_user(&self, username: &str, password: &str, role: &str) -> StoreResult<User> {
        if let Some(user) = self.get_user(username)? {
            return Ok(user);
        }
        self.create_user(username, password, role)
    }

    /// One-time migration: rehash rows whose hash column holds plaintext
    ///
    /// A row counts as plaintext when it does not parse as a bcrypt hash.
    /// Returns the number of rows rewritten.
    pub fn migrate_plaintext_passwords(&self) -> StoreResult<usize> {
        let rows: Vec<(String, String)> = {
            let conn = self.lock();
            let mut stmt = conn.prepare("SELECT username, password_hash FROM users")?;
            let collected = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };

        let mut migrated = 0;
        for (username, stored) in rows {
            // bcrypt hashes all carry the $2a$/$2b$/$2y$ prefix
            if stored.starts_with("$2") {
                continue;
            }
            let hash = bcrypt::hash(&stored, BCRYPT_COST)
                .map_err(|e| StoreError::Password(e.to_string()))?;
            let conn = self.lock();
            conn.execute(
                "UPDATE users SET password_hash = ?2 WHERE username = ?1",
                params![username, hash],
            )?;
            migrated += 1;
            tracing::warn!(user = %username, "rehashed legacy plaintext password");
        }
        Ok(migrated)
    }
}
