//! Read-only mode
//!
//! Protects a deployed agent's code and configuration from its own LLM:
//! a PreToolUse hook in the agent workspace intercepts file-writing
//! tools and checks the target path against block/allow glob patterns.
//! The control plane writes the config, the guard script and the hook
//! registration; enforcement happens inside the container.

use std::sync::Arc;

use trinity_core::types::{CredentialFiles, ReadOnlyConfig};
use trinity_core::Result;

use crate::transport::AgentTransport;

/// Patterns blocked by default: source, instructions, configuration
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    "*.py", "*.js", "*.ts", "*.jsx", "*.tsx", "*.vue", "*.svelte",
    "*.go", "*.rs", "*.rb", "*.java", "*.c", "*.cpp", "*.h",
    "*.sh", "*.bash", "Makefile", "Dockerfile",
    "CLAUDE.md", "README.md", ".claude/*", ".env", ".env.*",
    "template.yaml", "*.yaml", "*.yml", "*.json", "*.toml",
];

/// Output destinations that stay writable
pub const DEFAULT_ALLOWED_PATTERNS: &[&str] = &[
    "content/*", "output/*", "reports/*", "exports/*", "*.log", "*.txt",
];

const CONFIG_PATH: &str = ".trinity/read-only-config.json";
const GUARD_PATH: &str = ".trinity/hooks/read-only-guard.py";
const SETTINGS_PATH: &str = ".claude/settings.local.json";
const HOOK_MATCHER: &str = "Write|Edit|NotebookEdit";
const HOOK_COMMAND: &str = "python3 /home/developer/.trinity/hooks/read-only-guard.py";

// Guard script written into the workspace. Reads the tool call from
// stdin, checks the path against the config, exits 2 to block.
const GUARD_SCRIPT: &str = r#"#!/usr/bin/env python3
import fnmatch
import json
import os
import sys

CONFIG = os.path.expanduser("~/.trinity/read-only-config.json")

def matches(path, patterns):
    name = os.path.basename(path)
    return any(fnmatch.fnmatch(path, p) or fnmatch.fnmatch(name, p) for p in patterns)

def main():
    try:
        call = json.load(sys.stdin)
        with open(CONFIG) as f:
            config = json.load(f)
    except Exception:
        sys.exit(0)

    path = call.get("tool_input", {}).get("file_path", "")
    if not path:
        sys.exit(0)
    rel = os.path.relpath(path, os.path.expanduser("~/workspace"))
    if matches(rel, config.get("allowed_patterns", [])):
        sys.exit(0)
    if matches(rel, config.get("blocked_patterns", [])):
        print(f"read-only mode: writing {rel} is blocked", file=sys.stderr)
        sys.exit(2)
    sys.exit(0)

if __name__ == "__main__":
    main()
"#;

/// Reject configs whose globs would not compile on the guard side
pub fn validate_patterns(config: &ReadOnlyConfig) -> trinity_core::Result<()> {
    for pattern in config.block_patterns.iter().chain(&config.allow_patterns) {
        glob::Pattern::new(pattern).map_err(|e| {
            trinity_core::Error::Validation(format!("invalid glob pattern '{pattern}': {e}"))
        })?;
    }
    Ok(())
}

/// The default configuration applied when enabling without custom patterns
pub fn default_config() -> ReadOnlyConfig {
    ReadOnlyConfig {
        enabled: true,
        block_patterns: DEFAULT_BLOCKED_PATTERNS.iter().map(|p| p.to_string()).collect(),
        allow_patterns: DEFAULT_ALLOWED_PATTERNS.iter().map(|p| p.to_string()).collect(),
    }
}

fn config_json(config: &ReadOnlyConfig) -> serde_json::Value {
    serde_json::json!({
        "blocked_patterns": config.block_patterns,
        "allowed_patterns": config.allow_patterns,
    })
}

/// Write the guard files and register the hook in a running agent
pub async fn inject_hooks(
    transport: &Arc<dyn AgentTransport>,
    agent: &str,
    config: &ReadOnlyConfig,
) -> Result<()> {
    let mut files = CredentialFiles::new();
    files.insert(
        CONFIG_PATH.to_string(),
        serde_json::to_string_pretty(&config_json(config)).unwrap_or_default(),
    );
    files.insert(GUARD_PATH.to_string(), GUARD_SCRIPT.to_string());
    files.insert(
        SETTINGS_PATH.to_string(),
        merged_settings(existing_settings(transport, agent).await, true),
    );
    transport.inject_files(agent, &files).await?;
    tracing::info!(agent = %agent, "read-only hooks injected");
    Ok(())
}

/// Deregister the hook; config and guard files are left behind, inert
pub async fn remove_hooks(transport: &Arc<dyn AgentTransport>, agent: &str) -> Result<()> {
    let Some(existing) = existing_settings(transport, agent).await else {
        return Ok(());
    };
    let mut files = CredentialFiles::new();
    files.insert(SETTINGS_PATH.to_string(), merged_settings(Some(existing), false));
    transport.inject_files(agent, &files).await?;
    Ok(())
}

async fn existing_settings(
    transport: &Arc<dyn AgentTransport>,
    agent: &str,
) -> Option<serde_json::Value> {
    let paths = vec![SETTINGS_PATH.to_string()];
    let files = transport.read_files(agent, &paths).await.ok()?;
    serde_json::from_str(files.get(SETTINGS_PATH)?).ok()
}

/// Merge or strip the guard's PreToolUse registration, preserving
/// everything else in the settings file
fn merged_settings(existing: Option<serde_json::Value>, enabled: bool) -> String {
    let mut settings = match existing {
        Some(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
        _ => serde_json::json!({}),
    };

    let hooks = settings
        .as_object_mut()
        .expect("settings is an object")
        .entry("hooks")
        .or_insert_with(|| serde_json::json!({}));
    if !hooks.is_object() {
        *hooks = serde_json::json!({});
    }
    let pre = hooks
        .as_object_mut()
        .expect("hooks is an object")
        .entry("PreToolUse")
        .or_insert_with(|| serde_json::json!([]));
    let entries = match pre.as_array_mut() {
        Some(entries) => entries,
        None => {
            *pre = serde_json::json!([]);
            pre.as_array_mut().expect("just replaced with array")
        }
    };

    entries.retain(|entry| entry.get("matcher").and_then(|m| m.as_str()) != Some(HOOK_MATCHER));
    if enabled {
        entries.push(serde_json::json!({
            "matcher": HOOK_MATCHER,
            "hooks": [{"type": "command", "command": HOOK_COMMAND}],
        }));
    }

    serde_json::to_string_pretty(&settings).unwrap_or_else(|_| "{}".to_string())
}
