//! Shared domain types for the Trinity control plane
//!
//! These types cross every component boundary: the queue serializes
//! [`Execution`]s into the lock backend, the store persists
//! [`ScheduleExecution`] rows, and the server returns most of them
//! verbatim as JSON.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the singleton, privileged platform agent
pub const SYSTEM_AGENT_NAME: &str = "trinity-system";

/// Where an execution request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionSource {
    User,
    Schedule,
    Agent,
    System,
}

/// Lifecycle state of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Success,
    Failed,
    Terminated,
}

/// Who pulled the trigger, recorded on executions and activities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    User,
    Schedule,
    Agent,
    System,
    Manual,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Schedule => "schedule",
            Self::Agent => "agent",
            Self::System => "system",
            Self::Manual => "manual",
        }
    }
}

/// In-flight execution record, held in the lock backend while queued or
/// running. The authoritative outcome lives in [`ScheduleExecution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub agent_name: String,
    pub source: ExecutionSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<String>,
    pub message: String,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
}

impl Execution {
    /// Create a new execution request (not yet submitted)
    pub fn new(agent_name: impl Into<String>, message: impl Into<String>, source: ExecutionSource) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_name: agent_name.into(),
            source,
            source_agent: None,
            source_user_id: None,
            message: message.into(),
            queued_at: Utc::now(),
            started_at: None,
            status: ExecutionStatus::Queued,
        }
    }

    /// Attribute the request to the agent that dispatched it
    pub fn from_agent(mut self, agent: impl Into<String>) -> Self {
        self.source_agent = Some(agent.into());
        self
    }

    /// Attribute the request to the user that dispatched it
    pub fn from_user(mut self, user_id: impl Into<String>) -> Self {
        self.source_user_id = Some(user_id.into());
        self
    }
}

/// Snapshot of an agent's queue, for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub agent_name: String,
    pub is_busy: bool,
    pub current_execution: Option<Execution>,
    pub queue_length: usize,
    /// Oldest first
    pub queued_executions: Vec<Execution>,
}

/// Outcome of a queue submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Slot claimed; the caller must dispatch and later call `complete`
    Running,
    /// Parked behind the running slot at this 1-based position
    Queued(usize),
}

impl SubmitOutcome {
    /// Wire form: `"running"` or `"queued:N"`
    pub fn as_wire(&self) -> String {
        match self {
            Self::Running => "running".to_string(),
            Self::Queued(n) => format!("queued:{n}"),
        }
    }
}

/// Container state, normalized from the engine's richer set
///
/// `exited`, `dead` and `created` all collapse to `Stopped`; anything the
/// engine reports that is neither running nor a known stopped state maps
/// to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Stopped,
    Error,
}

impl ContainerState {
    pub fn from_engine(raw: &str) -> Self {
        match raw {
            "running" => Self::Running,
            "exited" | "dead" | "created" | "stopped" | "paused" | "restarting" | "removing" => {
                Self::Stopped
            }
            _ => Self::Error,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// CPU and memory limits applied to an agent container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: String,
    pub memory: String,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu: "2".to_string(),
            memory: "4g".to_string(),
        }
    }
}

/// Agent as reported by the container engine's labels
///
/// The labels are the source of truth for the agent index; only what
/// labels cannot carry (ownership, permissions, schedules) lives in the
/// state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub name: String,
    pub agent_type: String,
    pub status: ContainerState,
    pub ssh_port: u16,
    pub created: DateTime<Utc>,
    pub resources: Resources,
    pub container_id: Option<String>,
    pub template: Option<String>,
    pub is_system: bool,
}

/// Read-only mode configuration for an agent
///
/// When enabled, a hook file in the agent workspace intercepts the LLM's
/// file-write tools against these glob patterns. An empty block list
/// means "block everything not allowed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOnlyConfig {
    pub enabled: bool,
    #[serde(default)]
    pub block_patterns: Vec<String>,
    #[serde(default)]
    pub allow_patterns: Vec<String>,
}

/// Ownership row for an agent, kept in the state store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub owner_username: String,
    pub is_system: bool,
    pub autonomy_enabled: bool,
    pub read_only_mode: bool,
    pub use_platform_api_key: bool,
    pub created_at: DateTime<Utc>,
}

/// A cron-driven task bound to one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub agent_name: String,
    pub name: String,
    pub cron_expression: String,
    pub message: String,
    pub timezone: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Persisted outcome of one execution, scheduled or ad hoc
///
/// `schedule_id` is null for user-triggered runs. `response` and
/// `execution_log_json` are credential-sanitized before they reach the
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub id: String,
    pub schedule_id: Option<String>,
    pub agent_name: String,
    pub status: ExecutionStatus,
    pub message: String,
    pub response: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub triggered_by: TriggeredBy,
    pub context_used: Option<i64>,
    pub context_max: Option<i64>,
    pub cost: Option<f64>,
    pub tool_calls_json: Option<String>,
    pub execution_log_json: Option<String>,
}

/// Structured timeline event for an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ScheduleStart,
    ScheduleEnd,
    ToolCall,
    ChatStart,
    ChatEnd,
    ExecutionCancelled,
    AgentCollaboration,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScheduleStart => "schedule_start",
            Self::ScheduleEnd => "schedule_end",
            Self::ToolCall => "tool_call",
            Self::ChatStart => "chat_start",
            Self::ChatEnd => "chat_end",
            Self::ExecutionCancelled => "execution_cancelled",
            Self::AgentCollaboration => "agent_collaboration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Started,
    Completed,
    Failed,
}

/// One row of the activity timeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: String,
    pub agent_name: String,
    pub activity_type: ActivityType,
    pub activity_state: ActivityState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_activity_id: Option<String>,
    pub triggered_by: TriggeredBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_execution_id: Option<String>,
    /// Opaque payload; deserialized only where a consumer cares
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Scope of an MCP key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpScope {
    /// Acts on behalf of one user; permission checks apply
    User,
    /// Platform-privileged; bypasses permission checks, still audited
    System,
}

impl McpScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

/// Metadata for a minted MCP key; the token itself is only returned once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpKey {
    pub id: String,
    /// Short display prefix of the token, e.g. `trinity_mcp_a1b2`
    pub token_prefix: String,
    pub owner_username: String,
    /// Agent-scoped keys name their agent; user-scoped keys do not
    pub agent_name: Option<String>,
    pub scope: McpScope,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

/// Resolution of a presented MCP token: who is acting, and as what
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpIdentity {
    pub username: String,
    pub agent_name: Option<String>,
    pub scope: McpScope,
}

/// Result of one call against an agent's `task` endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub response: String,
    #[serde(default)]
    pub metadata: TaskMetadata,
    /// Raw execution transcript, relayed opaque
    #[serde(default)]
    pub execution_log: Option<serde_json::Value>,
}

/// Observability metadata reported by the agent for one turn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub context_window: Option<i64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub tool_calls: Option<serde_json::Value>,
}

/// Map of relative path → file body, as injected into agent workspaces
pub type CredentialFiles = HashMap<String, String>;
