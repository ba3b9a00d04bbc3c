//! # Trinity Store
//!
//! Embedded relational state store for the Trinity control plane: a
//! single SQLite file in WAL mode behind one shared connection.
//!
//! The container engine's labels remain the agent index; this store only
//! holds what labels cannot carry - ownership and mode flags, permission
//! edges, schedules, execution outcomes, the activity timeline, MCP key
//! hashes, users and settings.
//!
//! Schema migrations run idempotently at open: the baseline is pure
//! `CREATE TABLE IF NOT EXISTS`, everything after is an ALTER-only
//! forward migration keyed by the `schema_migrations` version row.

mod activities;
mod agents;
mod executions;
mod mcp_keys;
mod permissions;
mod schedules;
mod settings;
mod store;
mod users;

pub use executions::ExecutionOutcome;
pub use schedules::{NewSchedule, ScheduleUpdate};
pub use activities::NewActivity;
pub use settings::{ANTHROPIC_API_KEY, GITHUB_PAT, TRINITY_PROMPT};
pub use store::{StateStore, StoreError, StoreResult};
pub use users::User;
