//! # Trinity Core
//!
//! Domain types and core logic for the Trinity agent control plane: the
//! execution and scheduling substrate that supervises long-running
//! sandboxed agent containers.
//!
//! This crate is deliberately free of I/O. The container engine, the
//! lock/queue backend, the state store and the HTTP surface live in
//! `trinity-runtime`, `trinity-store` and `trinity-server`; what lives
//! here is everything they agree on:
//!
//! - [`types`] - executions, schedules, activities, agents, MCP keys
//! - [`error`] - the tagged error taxonomy crossing every boundary
//! - [`name`] - agent name validation (names double as DNS labels)
//! - [`cron`] - 5-field cron expressions with timezone-aware advancement
//! - [`envelope`] - AES-256-GCM credential envelopes (`.credentials.enc`)
//! - [`sanitizer`] - credential scrubbing before persistence or broadcast
//! - [`template`] - template parsing and credential-file rendering
//! - [`token`] - MCP bearer token minting and hashing

pub mod cron;
pub mod envelope;
pub mod error;
pub mod name;
pub mod sanitizer;
pub mod template;
pub mod token;
pub mod types;

pub use error::{Error, Result};
pub use types::SYSTEM_AGENT_NAME;
pub use types::{
    Activity, ActivityState, ActivityType, AgentRecord, AgentStatus, ContainerState,
    CredentialFiles, Execution, ExecutionSource, ExecutionStatus, McpIdentity, McpKey, McpScope,
    QueueStatus, ReadOnlyConfig, Resources, Schedule, ScheduleExecution, SubmitOutcome,
    TaskMetadata, TaskOutcome, TriggeredBy,
};
