//! Top-level error types for the Trinity control plane
//!
//! Component errors (queue, driver, transport, store) flatten into this
//! type at the service boundary. The HTTP layer in `trinity-server` is the
//! only place that maps these variants to status codes.

use thiserror::Error;

use crate::types::Execution;

/// Top-level error type for control-plane operations
///
/// Variants correspond to how callers need to handle them:
///
/// - [`Error::Validation`] - fix the request and retry
/// - [`Error::Auth`] - missing or invalid credentials
/// - [`Error::Permission`] - actor lacks access to the target
/// - [`Error::NotFound`] - agent/schedule/execution absent
/// - [`Error::Conflict`] - duplicate name or conflicting state
/// - [`Error::QueueFull`] - agent wait list is at capacity; back off
/// - [`Error::AgentBusy`] - caller disallowed waiting
/// - [`Error::QueueUnavailable`] - lock/queue backend unreachable
/// - [`Error::AgentNotReachable`] - agent container did not answer
/// - [`Error::Internal`] - anything uncaught; logged with a reference
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input (bad name, bad cron, too many credentials)
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or invalid JWT / MCP key
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Actor lacks permission for the target
    #[error("permission denied: {0}")]
    Permission(String),

    /// Requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate name or conflicting state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Agent wait list is at capacity
    #[error("agent '{agent_name}' queue is full ({queue_length} waiting)")]
    QueueFull {
        agent_name: String,
        queue_length: usize,
        /// Remaining TTL of the running slot, when known
        retry_after_secs: Option<u64>,
    },

    /// Agent is executing and the caller chose not to wait
    #[error("agent '{agent_name}' is currently executing")]
    AgentBusy {
        agent_name: String,
        current_execution: Option<Box<Execution>>,
    },

    /// Lock/queue backend unreachable; submit fails closed
    #[error("queue backend unavailable: {0}")]
    QueueUnavailable(String),

    /// Queued caller's slot did not promote within the wait timeout
    #[error("timed out waiting in queue for agent '{agent_name}'")]
    QueueTimeout { agent_name: String },

    /// Agent container could not be reached
    #[error("agent not reachable: {0}")]
    AgentNotReachable(String),

    /// Anything uncaught; full detail is logged, not exposed
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if this error is a client-side validation problem
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an authentication error
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Returns true if this is a permission error
    pub fn is_permission(&self) -> bool {
        matches!(self, Self::Permission(_))
    }

    /// Returns true if the target was not found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for queue-capacity rejections
    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    /// Returns true if this error is potentially retryable
    ///
    /// Backpressure and availability errors clear on their own; validation,
    /// auth and permission errors do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. }
                | Self::AgentBusy { .. }
                | Self::QueueUnavailable(_)
                | Self::QueueTimeout { .. }
                | Self::AgentNotReachable(_)
        )
    }

    /// Shorthand for an internal error from any displayable cause
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Result type for control-plane operations
pub type Result<T> = std::result::Result<T, Error>;
