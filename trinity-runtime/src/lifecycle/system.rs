//! System agent supervision
//!
//! The system agent is the singleton platform orchestrator: deployed
//! automatically on boot, never deletable, re-created if its container
//! vanished and restarted if it stopped. Its MCP key carries `system`
//! scope, which bypasses permission checks downstream.

use trinity_core::name::{container_name, workspace_volume};
use trinity_core::types::{ContainerState, McpScope, SYSTEM_AGENT_NAME};
use trinity_core::Result;

use super::{CreateAgentRequest, LifecycleManager};

/// Template the system agent is materialized from
pub const SYSTEM_AGENT_TEMPLATE: &str = "local:trinity-system";

/// The system agent belongs to the platform admin account
pub const SYSTEM_AGENT_OWNER: &str = "admin";

/// Capabilities the system agent keeps after the blanket drop; it
/// installs packages and manages processes for operational tasks
pub const SYSTEM_AGENT_CAPABILITIES: &[&str] = &[
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "SETGID",
    "SETUID",
    "KILL",
    "NET_BIND_SERVICE",
    "AUDIT_WRITE",
];

/// What boot supervision did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemAgentAction {
    AlreadyRunning,
    Started,
    Created,
}

impl LifecycleManager {
    /// Ensure the system agent exists, runs and holds a system-scoped key
    ///
    /// Called on every boot; each step is idempotent.
    pub async fn ensure_system_agent(&self) -> Result<SystemAgentAction> {
        let action = match self.get_agent(SYSTEM_AGENT_NAME).await? {
            Some(agent) => {
                // Repair the ownership row if it lost its system flag
                self.store()
                    .register_agent_owner(SYSTEM_AGENT_NAME, SYSTEM_AGENT_OWNER, true)?;

                if agent.status == ContainerState::Running {
                    SystemAgentAction::AlreadyRunning
                } else {
                    self.start_agent(SYSTEM_AGENT_NAME).await?;
                    SystemAgentAction::Started
                }
            }
            None => {
                self.create_internal(
                    SYSTEM_AGENT_OWNER,
                    CreateAgentRequest {
                        name: SYSTEM_AGENT_NAME.to_string(),
                        template: Some(SYSTEM_AGENT_TEMPLATE.to_string()),
                        ..Default::default()
                    },
                    true,
                )
                .await?;
                SystemAgentAction::Created
            }
        };

        if !self.store().has_system_mcp_key(SYSTEM_AGENT_NAME)? {
            self.store().create_mcp_key(
                SYSTEM_AGENT_OWNER,
                Some(SYSTEM_AGENT_NAME),
                McpScope::System,
                Some("Auto-generated system agent MCP key"),
            )?;
            tracing::info!("minted system-scoped MCP key for system agent");
        }

        self.inject_runtime_files(SYSTEM_AGENT_NAME).await;
        tracing::info!(action = ?action, "system agent supervision complete");
        Ok(action)
    }

    /// Wipe the system agent's workspace, restart it and re-inject files
    ///
    /// The recovery path for a wedged system agent, since deletion is
    /// off the table.
    pub async fn reinitialize_system_agent(&self) -> Result<()> {
        let container = container_name(SYSTEM_AGENT_NAME);
        self.driver.stop(&container, 10).await?;
        if let Err(e) = self.driver.remove(&container, true).await {
            tracing::warn!(error = %e, "system agent container remove failed");
        }
        self.driver
            .remove_volume(&workspace_volume(SYSTEM_AGENT_NAME))
            .await?;

        // Drop the ownership row so creation starts clean; keys survive
        {
            let record = self.store().get_agent_record(SYSTEM_AGENT_NAME)?;
            if record.is_some() {
                // The row is system-flagged; re-register as non-system so
                // the guarded delete can clear it, then recreate below.
                self.store()
                    .register_agent_owner(SYSTEM_AGENT_NAME, SYSTEM_AGENT_OWNER, false)?;
                self.store().delete_agent_record(SYSTEM_AGENT_NAME)?;
            }
        }

        self.ensure_system_agent().await?;
        tracing::info!("system agent reinitialized");
        Ok(())
    }
}
