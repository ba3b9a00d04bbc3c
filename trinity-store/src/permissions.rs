//! Inter-agent permission edges
//!
//! A row `(source, target)` means "source may dispatch to target". Edges
//! are directed; owner-default creation inserts both directions. Foreign
//! keys cascade, so deleting an agent removes every edge touching it.

use chrono::Utc;
use rusqlite::params;

use crate::store::{ts, StateStore, StoreResult};

impl StateStore {
    /// Insert a permission edge; idempotent
    ///
    /// Callers validate existence and self-edges before this point; the
    /// foreign keys still back them up.
    pub fn grant_permission(&self, source: &str, target: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "INSERT OR IGNORE INTO agent_permissions (source_agent, target_agent, created_at)
             VALUES (?1, ?2, ?3)",
            params![source, target, ts(Utc::now())],
        )?;
        Ok(n > 0)
    }

    /// Remove a permission edge; idempotent
    pub fn revoke_permission(&self, source: &str, target: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM agent_permissions WHERE source_agent = ?1 AND target_agent = ?2",
            params![source, target],
        )?;
        Ok(n > 0)
    }

    /// Is the edge `source → target` present?
    pub fn has_permission(&self, source: &str, target: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agent_permissions
             WHERE source_agent = ?1 AND target_agent = ?2",
            params![source, target],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Agents `source` may dispatch to
    pub fn list_reachable_agents(&self, source: &str) -> StoreResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT target_agent FROM agent_permissions
             WHERE source_agent = ?1 ORDER BY target_agent",
        )?;
        let names = stmt
            .query_map(params![source], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Agents that may dispatch to `target`
    pub fn list_inbound_agents(&self, target: &str) -> StoreResult<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT source_agent FROM agent_permissions
             WHERE target_agent = ?1 ORDER BY source_agent",
        )?;
        let names = stmt
            .query_map(params![target], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Open bidirectional edges between `agent` and every other agent the
    /// owner has, plus both directions with the system agent
    ///
    /// Agents of one owner form a trust cohort by construction;
    /// cross-owner edges stay opt-in.
    pub fn grant_default_permissions(&self, agent: &str, owner_username: &str) -> StoreResult<usize> {
        let peers = self.list_agents_owned_by(owner_username)?;
        let mut inserted = 0;
        for peer in peers.iter().filter(|p| p.as_str() != agent) {
            if self.grant_permission(agent, peer)? {
                inserted += 1;
            }
            if self.grant_permission(peer, agent)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_agents(names: &[&str]) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        for name in names {
            store.register_agent_owner(name, "ada", false).unwrap();
        }
        store
    }

    #[test]
    fn test_grant_and_check() {
        let store = store_with_agents(&["alpha", "beta"]);
        assert!(store.grant_permission("alpha", "beta").unwrap());
        assert!(store.has_permission("alpha", "beta").unwrap());
        // Directed: the reverse edge does not exist
        assert!(!store.has_permission("beta", "alpha").unwrap());
    }

    #[test]
    fn test_grant_is_idempotent() {
        let store = store_with_agents(&["alpha", "beta"]);
        assert!(store.grant_permission("alpha", "beta").unwrap());
        assert!(!store.grant_permission("alpha", "beta").unwrap());
        assert_eq!(store.list_reachable_agents("alpha").unwrap().len(), 1);
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let store = store_with_agents(&["alpha", "beta"]);
        store.grant_permission("alpha", "beta").unwrap();
        assert!(store.revoke_permission("alpha", "beta").unwrap());
        assert!(!store.revoke_permission("alpha", "beta").unwrap());
        assert!(!store.has_permission("alpha", "beta").unwrap());
    }

    #[test]
    fn test_grant_unknown_agent_fails_fk() {
        let store = store_with_agents(&["alpha"]);
        assert!(store.grant_permission("alpha", "ghost").is_err());
    }

    #[test]
    fn test_owner_default_bidirectional() {
        let store = store_with_agents(&["alpha", "beta", "gamma"]);
        let inserted = store.grant_default_permissions("gamma", "ada").unwrap();
        assert_eq!(inserted, 4);
        assert!(store.has_permission("gamma", "alpha").unwrap());
        assert!(store.has_permission("alpha", "gamma").unwrap());
        assert!(store.has_permission("gamma", "beta").unwrap());
        assert!(store.has_permission("beta", "gamma").unwrap());
        // No self edge
        assert!(!store.has_permission("gamma", "gamma").unwrap());
    }

    #[test]
    fn test_cascade_on_agent_delete() {
        let store = store_with_agents(&["alpha", "beta"]);
        store.grant_permission("alpha", "beta").unwrap();
        store.grant_permission("beta", "alpha").unwrap();

        store.delete_agent_record("beta").unwrap();

        assert!(store.list_reachable_agents("alpha").unwrap().is_empty());
        assert!(store.list_inbound_agents("alpha").unwrap().is_empty());
    }

    #[test]
    fn test_listings_are_sorted() {
        let store = store_with_agents(&["alpha", "beta", "gamma"]);
        store.grant_permission("alpha", "gamma").unwrap();
        store.grant_permission("alpha", "beta").unwrap();
        assert_eq!(store.list_reachable_agents("alpha").unwrap(), vec!["beta", "gamma"]);
    }
}
