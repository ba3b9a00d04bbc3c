//! Permission resolver
//!
//! Policy layer over the stored permission edges. The store enforces
//! referential integrity; this layer enforces the semantics: strict
//! validation of grant targets, implicit self-edges, and the system
//! agent's standing access in both directions.

use trinity_core::types::SYSTEM_AGENT_NAME;
use trinity_core::{Error, Result};
use trinity_store::StateStore;

/// Checks and mutations on the "may A dispatch to B" relation
#[derive(Clone)]
pub struct PermissionResolver {
    store: StateStore,
}

impl PermissionResolver {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Grant `source → target`; idempotent
    ///
    /// Unknown agents are rejected at write time, self-edges always.
    pub fn grant(&self, source: &str, target: &str) -> Result<bool> {
        if source == target {
            return Err(Error::Validation(
                "an agent always reaches itself; self-grants are rejected".to_string(),
            ));
        }
        self.require_registered(source)?;
        self.require_registered(target)?;
        Ok(self.store.grant_permission(source, target)?)
    }

    /// Revoke `source → target`; idempotent
    pub fn revoke(&self, source: &str, target: &str) -> Result<bool> {
        self.require_registered(source)?;
        self.require_registered(target)?;
        Ok(self.store.revoke_permission(source, target)?)
    }

    /// May `actor` dispatch to `target`?
    ///
    /// Self-dispatch is implicitly allowed; the system agent reaches and
    /// is reachable by everything.
    pub fn can_dispatch(&self, actor: &str, target: &str) -> Result<bool> {
        if actor == target || actor == SYSTEM_AGENT_NAME || target == SYSTEM_AGENT_NAME {
            return Ok(true);
        }
        Ok(self.store.has_permission(actor, target)?)
    }

    /// Agents `actor` may dispatch to
    pub fn list_reachable(&self, actor: &str) -> Result<Vec<String>> {
        self.require_registered(actor)?;
        let mut targets = self.store.list_reachable_agents(actor)?;
        if actor != SYSTEM_AGENT_NAME
            && self.store.get_agent_record(SYSTEM_AGENT_NAME)?.is_some()
            && !targets.iter().any(|t| t == SYSTEM_AGENT_NAME)
        {
            targets.push(SYSTEM_AGENT_NAME.to_string());
            targets.sort();
        }
        Ok(targets)
    }

    /// Agents that may dispatch to `target`
    pub fn list_inbound(&self, target: &str) -> Result<Vec<String>> {
        self.require_registered(target)?;
        let mut sources = self.store.list_inbound_agents(target)?;
        if target != SYSTEM_AGENT_NAME
            && self.store.get_agent_record(SYSTEM_AGENT_NAME)?.is_some()
            && !sources.iter().any(|s| s == SYSTEM_AGENT_NAME)
        {
            sources.push(SYSTEM_AGENT_NAME.to_string());
            sources.sort();
        }
        Ok(sources)
    }

    /// Owner-default edges for a freshly created agent
    pub fn apply_owner_defaults(&self, agent: &str, owner_username: &str) -> Result<usize> {
        Ok(self.store.grant_default_permissions(agent, owner_username)?)
    }

    fn require_registered(&self, agent: &str) -> Result<()> {
        if self.store.get_agent_record(agent)?.is_none() {
            return Err(Error::NotFound(format!("agent '{agent}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_with(names: &[&str]) -> PermissionResolver {
        let store = StateStore::open_in_memory().unwrap();
        for name in names {
            let is_system = *name == SYSTEM_AGENT_NAME;
            let owner = if is_system { "admin" } else { "ada" };
            store.register_agent_owner(name, owner, is_system).unwrap();
        }
        PermissionResolver::new(store)
    }

    #[test]
    fn test_grant_then_check() {
        let resolver = resolver_with(&["alpha", "beta"]);
        assert!(resolver.grant("alpha", "beta").unwrap());
        assert!(resolver.can_dispatch("alpha", "beta").unwrap());
        assert!(!resolver.can_dispatch("beta", "alpha").unwrap());
    }

    #[test]
    fn test_grant_rejects_unknown_target() {
        let resolver = resolver_with(&["alpha"]);
        let err = resolver.grant("alpha", "ghost").unwrap_err();
        assert!(err.is_not_found());
        let err = resolver.grant("ghost", "alpha").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_self_edges_implicit_but_not_grantable() {
        let resolver = resolver_with(&["alpha"]);
        assert!(resolver.can_dispatch("alpha", "alpha").unwrap());
        assert!(resolver.grant("alpha", "alpha").unwrap_err().is_validation());
    }

    #[test]
    fn test_grant_revoke_idempotent() {
        let resolver = resolver_with(&["alpha", "beta"]);
        assert!(resolver.grant("alpha", "beta").unwrap());
        assert!(!resolver.grant("alpha", "beta").unwrap());
        assert!(resolver.revoke("alpha", "beta").unwrap());
        assert!(!resolver.revoke("alpha", "beta").unwrap());
    }

    #[test]
    fn test_system_agent_bypasses_edges() {
        let resolver = resolver_with(&["alpha", SYSTEM_AGENT_NAME]);
        assert!(resolver.can_dispatch(SYSTEM_AGENT_NAME, "alpha").unwrap());
        assert!(resolver.can_dispatch("alpha", SYSTEM_AGENT_NAME).unwrap());
    }

    #[test]
    fn test_listings_include_system_agent() {
        let resolver = resolver_with(&["alpha", "beta", SYSTEM_AGENT_NAME]);
        resolver.grant("alpha", "beta").unwrap();
        let reachable = resolver.list_reachable("alpha").unwrap();
        assert_eq!(reachable, vec!["beta", SYSTEM_AGENT_NAME]);
        let inbound = resolver.list_inbound("alpha").unwrap();
        assert_eq!(inbound, vec![SYSTEM_AGENT_NAME]);
    }

    #[test]
    fn test_owner_defaults_form_cohort() {
        let resolver = resolver_with(&["alpha", "beta", "gamma"]);
        resolver.apply_owner_defaults("gamma", "ada").unwrap();
        assert!(resolver.can_dispatch("gamma", "alpha").unwrap());
        assert!(resolver.can_dispatch("beta", "gamma").unwrap());
    }
}
