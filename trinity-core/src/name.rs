//! Agent name validation
//!
//! Agent names double as container names and DNS labels, so the rules are
//! the intersection of both: lowercase slug, digits and single hyphens,
//! starting with a letter or digit.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

/// Longest permitted agent name; leaves room for the `agent-` container
/// prefix within the engine's 63-character DNS label limit.
pub const MAX_NAME_LEN: usize = 56;

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("static regex");
}

/// Validate an agent name, returning it unchanged on success
pub fn validate_agent_name(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(Error::Validation("agent name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "agent name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    if !NAME_RE.is_match(name) {
        return Err(Error::Validation(format!(
            "agent name '{name}' must be lowercase letters, digits and hyphens"
        )));
    }
    if name.ends_with('-') || name.contains("--") {
        return Err(Error::Validation(format!(
            "agent name '{name}' must not end with or repeat hyphens"
        )));
    }
    Ok(name)
}

/// Container name for an agent: `agent-{name}`
pub fn container_name(agent_name: &str) -> String {
    format!("agent-{agent_name}")
}

/// Inverse of [`container_name`]
pub fn agent_name_from_container(container: &str) -> &str {
    container.strip_prefix("agent-").unwrap_or(container)
}

/// Workspace volume name for an agent
pub fn workspace_volume(agent_name: &str) -> String {
    format!("agent-{agent_name}-workspace")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_slugs() {
        for name in ["alpha", "beta-2", "a", "research-crawler-01", "x1"] {
            assert!(validate_agent_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_rejects_invalid_names() {
        for name in [
            "", "Alpha", "has space", "under_score", "-leading", "trailing-", "dou--ble",
            "ünicode",
        ] {
            assert!(validate_agent_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn test_rejects_over_long_names() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(validate_agent_name(&name).is_err());
        let name = "a".repeat(MAX_NAME_LEN);
        assert!(validate_agent_name(&name).is_ok());
    }

    #[test]
    fn test_container_name_round_trip() {
        assert_eq!(container_name("alpha"), "agent-alpha");
        assert_eq!(agent_name_from_container("agent-alpha"), "alpha");
        assert_eq!(agent_name_from_container("not-prefixed"), "not-prefixed");
    }
}
