//! Distributed locks for scheduler coordination
//!
//! A lock is a `SET NX EX` claim holding a random token; release is a
//! compare-and-delete so an expired holder cannot free a peer's claim.
//! Locks guard per-schedule dispatch, leader election and instance
//! heartbeats.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::backend::{BackendResult, KvBackend};

const LOCK_PREFIX: &str = "scheduler:lock:";
const HEARTBEAT_PREFIX: &str = "scheduler:heartbeat:";
const LEADER_KEY: &str = "scheduler:leader";

/// Default TTL on per-schedule locks
pub const SCHEDULE_LOCK_TTL: Duration = Duration::from_secs(60);

/// TTL on instance heartbeats and the leader claim
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(45);

/// One acquired (or acquirable) distributed lock
pub struct DistributedLock {
    backend: Arc<dyn KvBackend>,
    name: String,
    token: String,
    ttl: Duration,
}

impl DistributedLock {
    fn new(backend: Arc<dyn KvBackend>, name: &str, ttl: Duration) -> Self {
        Self {
            backend,
            name: format!("{LOCK_PREFIX}{name}"),
            token: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    /// Fully prefixed key of this lock
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking acquire; returns whether this instance now holds it
    pub async fn acquire(&self) -> BackendResult<bool> {
        self.backend
            .set_nx_ex(&self.name, &self.token, self.ttl)
            .await
    }

    /// Release if still held by this instance
    pub async fn release(&self) -> BackendResult<bool> {
        self.backend.del_if_equals(&self.name, &self.token).await
    }
}

/// Factory for the scheduler's locks and heartbeats
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn KvBackend>,
    instance_id: String,
}

impl LockManager {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Stable id of this scheduler instance
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Lock guarding one schedule's dispatch
    pub fn schedule_lock(&self, schedule_id: &str) -> DistributedLock {
        DistributedLock::new(
            self.backend.clone(),
            &format!("schedule:{schedule_id}"),
            SCHEDULE_LOCK_TTL,
        )
    }

    /// Try to claim one schedule; `None` when a peer holds it
    pub async fn try_acquire_schedule_lock(
        &self,
        schedule_id: &str,
    ) -> BackendResult<Option<DistributedLock>> {
        let lock = self.schedule_lock(schedule_id);
        Ok(lock.acquire().await?.then_some(lock))
    }

    /// Is some worker currently dispatching this schedule?
    pub async fn is_schedule_locked(&self, schedule_id: &str) -> BackendResult<bool> {
        self.backend
            .exists(&format!("{LOCK_PREFIX}schedule:{schedule_id}"))
            .await
    }

    /// Refresh this instance's liveness marker
    pub async fn set_heartbeat(&self) -> BackendResult<()> {
        self.backend
            .set_ex(
                &format!("{HEARTBEAT_PREFIX}{}", self.instance_id),
                "alive",
                HEARTBEAT_TTL,
            )
            .await
    }

    /// Claim or refresh scheduler leadership
    ///
    /// Exactly one instance holds `scheduler:leader` at a time; the
    /// holder refreshes the TTL each tick and dispatches, everyone else
    /// idles until the claim lapses.
    pub async fn try_lead(&self) -> BackendResult<bool> {
        if self
            .backend
            .set_nx_ex(LEADER_KEY, &self.instance_id, HEARTBEAT_TTL)
            .await?
        {
            return Ok(true);
        }
        match self.backend.get(LEADER_KEY).await? {
            Some(holder) if holder == self.instance_id => {
                self.backend
                    .set_ex(LEADER_KEY, &self.instance_id, HEARTBEAT_TTL)
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Give up leadership (shutdown path)
    pub async fn resign_leadership(&self) -> BackendResult<bool> {
        self.backend.del_if_equals(LEADER_KEY, &self.instance_id).await
    }
}
