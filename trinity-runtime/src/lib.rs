//! # Trinity Runtime
//!
//! The execution substrate of the Trinity control plane: everything
//! between the HTTP surface and the outside world.
//!
//! - [`docker`] - container driver; engine labels are the agent index
//! - [`backend`] - shared lock & queue backend (Redis, or in-memory)
//! - [`queue`] - per-agent single-slot execution queue with wait list
//! - [`locks`] - distributed locks, leader claim, heartbeats
//! - [`transport`] - HTTP client to each agent's in-container server
//! - [`permissions`] - the "may A dispatch to B" resolver
//! - [`credentials`] - encrypted envelope export/import
//! - [`activity`] - timeline persistence plus broadcast fan-out
//! - [`lifecycle`] - agent creation, supervision and tear-down
//! - [`scheduler`] - cron tick loop with per-schedule locking
//!
//! Per-agent serialization is not achieved by single-threading the
//! control plane: the queue's atomic claim on the shared backend is the
//! only enforcement point, so any number of workers stay correct.

pub mod activity;
pub mod backend;
pub mod credentials;
pub mod docker;
pub mod lifecycle;
pub mod locks;
pub mod permissions;
pub mod queue;
pub mod scheduler;
pub mod templates;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use activity::{ActivityEvent, ActivityService};
pub use backend::{BackendError, KvBackend, MemoryBackend, RedisBackend};
pub use credentials::CredentialService;
pub use docker::{ContainerDriver, ContainerSpec, DockerDriver, DriverError};
pub use lifecycle::{
    CreateAgentRequest, CreatedAgent, LifecycleConfig, LifecycleManager, SystemAgentAction,
    TerminationStatus,
};
pub use locks::{DistributedLock, LockManager};
pub use permissions::PermissionResolver;
pub use queue::{ExecutionQueue, EXECUTION_TTL, MAX_QUEUE_SIZE, QUEUE_WAIT_TIMEOUT};
pub use scheduler::{Scheduler, SchedulerStatus, SCHEDULER_TICK};
pub use templates::TemplateResolver;
pub use transport::{AgentTransport, HttpAgentTransport, TransportError};
