//! Per-agent execution queue
//!
//! The enforcement point for "one execution at a time per agent" across
//! every worker process, which is why it lives in the shared backend
//! rather than process memory.
//!
//! Keys:
//! - `agent:running:{name}` - the active execution, TTL-capped so a
//!   crashed control plane cannot leave a slot claimed forever
//! - `agent:queue:{name}` - bounded FIFO of waiting executions, newest
//!   left-pushed, oldest right-popped

use std::sync::Arc;
use std::time::Duration;

use trinity_core::types::{Execution, ExecutionStatus, QueueStatus, SubmitOutcome};
use trinity_core::{Error, Result};

use crate::backend::{BackendError, KvBackend};

/// Max waiting requests per agent
pub const MAX_QUEUE_SIZE: usize = 3;

/// TTL on the running slot; caps zombie executions
pub const EXECUTION_TTL: Duration = Duration::from_secs(600);

/// Max time a queued caller waits before `QueueTimeout`
pub const QUEUE_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

const RUNNING_PREFIX: &str = "agent:running:";
const QUEUE_PREFIX: &str = "agent:queue:";

fn running_key(agent: &str) -> String {
    format!("{RUNNING_PREFIX}{agent}")
}

fn queue_key(agent: &str) -> String {
    format!("{QUEUE_PREFIX}{agent}")
}

fn unavailable(err: BackendError) -> Error {
    Error::QueueUnavailable(err.to_string())
}

fn corrupt(err: serde_json::Error) -> Error {
    Error::Internal(format!("queue record corrupt: {err}"))
}

/// Backend-backed execution queue for agents
///
/// Cheap to clone; clones share the backend handle.
#[derive(Clone)]
pub struct ExecutionQueue {
    backend: Arc<dyn KvBackend>,
}

impl ExecutionQueue {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Submit an execution request for an agent
    ///
    /// Claims the running slot if free. Otherwise either queues the
    /// request (`wait_if_busy`) or fails with [`Error::AgentBusy`]
    /// carrying the current execution. A full wait list fails with
    /// [`Error::QueueFull`]; a dead backend fails closed with
    /// [`Error::QueueUnavailable`].
    pub async fn submit(
        &self,
        mut execution: Execution,
        wait_if_busy: bool,
    ) -> Result<(SubmitOutcome, Execution)> {
        let agent = execution.agent_name.clone();
        let running = running_key(&agent);

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(chrono::Utc::now());
        let claim = serde_json::to_string(&execution).map_err(corrupt)?;

        let claimed = self
            .backend
            .set_nx_ex(&running, &claim, EXECUTION_TTL)
            .await
            .map_err(unavailable)?;
        if claimed {
            tracing::info!(agent = %agent, execution = %execution.id, "execution started");
            return Ok((SubmitOutcome::Running, execution));
        }

        // Slot is held; restore the pending shape before queueing
        execution.status = ExecutionStatus::Queued;
        execution.started_at = None;

        if !wait_if_busy {
            let current = self.current_execution(&agent).await.ok().flatten();
            return Err(Error::AgentBusy {
                agent_name: agent,
                current_execution: current.map(Box::new),
            });
        }

        let queue = queue_key(&agent);
        let queue_len = self.backend.llen(&queue).await.map_err(unavailable)?;
        if queue_len >= MAX_QUEUE_SIZE {
            tracing::warn!(agent = %agent, queue_len, "queue full, rejecting submit");
            return Err(Error::QueueFull {
                agent_name: agent,
                queue_length: queue_len,
                retry_after_secs: self.running_ttl(&execution.agent_name).await,
            });
        }

        let pending = serde_json::to_string(&execution).map_err(corrupt)?;
        self.backend
            .lpush(&queue, &pending)
            .await
            .map_err(unavailable)?;
        let position = queue_len + 1;
        tracing::info!(agent = %execution.agent_name, execution = %execution.id, position, "execution queued");
        Ok((SubmitOutcome::Queued(position), execution))
    }

    /// Mark the current execution done and promote the next waiter
    ///
    /// The caller records the outcome in the state store before this
    /// point, and is responsible for actually dispatching the returned
    /// execution. Returns `None` when the agent goes idle.
    pub async fn complete(&self, agent: &str, success: bool) -> Result<Option<Execution>> {
        let running = running_key(agent);

        if let Some(raw) = self.backend.get(&running).await.map_err(unavailable)? {
            if let Ok(finished) = serde_json::from_str::<Execution>(&raw) {
                let status = if success { "completed" } else { "failed" };
                tracing::info!(agent = %agent, execution = %finished.id, status, "execution finished");
            }
        }

        match self.backend.rpop(&queue_key(agent)).await.map_err(unavailable)? {
            Some(raw) => {
                let mut next: Execution = serde_json::from_str(&raw).map_err(corrupt)?;
                next.status = ExecutionStatus::Running;
                next.started_at = Some(chrono::Utc::now());
                let claim = serde_json::to_string(&next).map_err(corrupt)?;
                self.backend
                    .set_ex(&running, &claim, EXECUTION_TTL)
                    .await
                    .map_err(unavailable)?;
                tracing::info!(agent = %agent, execution = %next.id, "promoted next execution");
                Ok(Some(next))
            }
            None => {
                self.backend.del(&running).await.map_err(unavailable)?;
                tracing::info!(agent = %agent, "queue empty, agent idle");
                Ok(None)
            }
        }
    }

    /// Wait until this execution occupies the running slot
    ///
    /// Queued callers poll for their promotion; whoever calls `complete`
    /// moves the next waiter into the slot, and that waiter's poll here
    /// unblocks. Expires with [`Error::QueueTimeout`].
    pub async fn wait_for_turn(
        &self,
        execution: &Execution,
        timeout: Duration,
    ) -> Result<Execution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(current) = self.current_execution(&execution.agent_name).await? {
                if current.id == execution.id {
                    return Ok(current);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::QueueTimeout {
                    agent_name: execution.agent_name.clone(),
                });
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Queue snapshot for observability
    pub async fn get_status(&self, agent: &str) -> Result<QueueStatus> {
        let current_execution = self.current_execution(agent).await?;

        let mut queued: Vec<Execution> = Vec::new();
        for raw in self
            .backend
            .lrange_all(&queue_key(agent))
            .await
            .map_err(unavailable)?
        {
            queued.push(serde_json::from_str(&raw).map_err(corrupt)?);
        }
        // lrange is newest-first; present oldest-first
        queued.reverse();

        Ok(QueueStatus {
            agent_name: agent.to_string(),
            is_busy: current_execution.is_some(),
            queue_length: queued.len(),
            current_execution,
            queued_executions: queued,
        })
    }

    /// Is the agent currently executing?
    pub async fn is_busy(&self, agent: &str) -> Result<bool> {
        self.backend
            .exists(&running_key(agent))
            .await
            .map_err(unavailable)
    }

    /// The running execution, if any
    pub async fn current_execution(&self, agent: &str) -> Result<Option<Execution>> {
        let raw = self
            .backend
            .get(&running_key(agent))
            .await
            .map_err(unavailable)?;
        raw.map(|r| serde_json::from_str(&r).map_err(corrupt)).transpose()
    }

    /// Remaining TTL of the running slot in whole seconds
    pub async fn running_ttl(&self, agent: &str) -> Option<u64> {
        self.backend
            .ttl(&running_key(agent))
            .await
            .ok()
            .flatten()
            .map(|d| d.as_secs())
    }

    /// Drop every waiter; never touches the running slot
    pub async fn clear_queue(&self, agent: &str) -> Result<usize> {
        let queue = queue_key(agent);
        let count = self.backend.llen(&queue).await.map_err(unavailable)?;
        if count > 0 {
            self.backend.del(&queue).await.map_err(unavailable)?;
            tracing::info!(agent = %agent, count, "cleared queued executions");
        }
        Ok(count)
    }

    /// Emergency break: clear the running slot of a dead agent
    ///
    /// Returns whether a running execution existed.
    pub async fn force_release(&self, agent: &str) -> Result<bool> {
        let existed = self
            .backend
            .del(&running_key(agent))
            .await
            .map_err(unavailable)?;
        if existed {
            tracing::warn!(agent = %agent, "force released running slot");
        }
        Ok(existed)
    }

    /// Names of all agents holding a running slot
    pub async fn get_all_busy_agents(&self) -> Result<Vec<String>> {
        let keys = self
            .backend
            .keys(&format!("{RUNNING_PREFIX}*"))
            .await
            .map_err(unavailable)?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(RUNNING_PREFIX).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use trinity_core::types::ExecutionSource;

    fn queue() -> ExecutionQueue {
        ExecutionQueue::new(Arc::new(MemoryBackend::new()))
    }

    fn exec(agent: &str, message: &str) -> Execution {
        Execution::new(agent, message, ExecutionSource::User)
    }

    #[tokio::test]
    async fn test_first_submit_runs_immediately() {
        let queue = queue();
        let (outcome, execution) = queue.submit(exec("alpha", "hi"), true).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Running);
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert!(execution.started_at.is_some());

        let status = queue.get_status("alpha").await.unwrap();
        assert!(status.is_busy);
        assert_eq!(status.current_execution.unwrap().id, execution.id);
    }

    #[tokio::test]
    async fn test_single_slot_per_agent() {
        let queue = queue();
        queue.submit(exec("alpha", "first"), true).await.unwrap();
        let (outcome, _) = queue.submit(exec("alpha", "second"), true).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Queued(1));

        // Different agents run in parallel
        let (outcome, _) = queue.submit(exec("beta", "other"), true).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Running);
    }

    #[tokio::test]
    async fn test_queue_positions_accumulate() {
        let queue = queue();
        queue.submit(exec("alpha", "running"), true).await.unwrap();
        for expected in 1..=MAX_QUEUE_SIZE {
            let (outcome, _) = queue
                .submit(exec("alpha", &format!("wait-{expected}")), true)
                .await
                .unwrap();
            assert_eq!(outcome, SubmitOutcome::Queued(expected));
        }
    }

    #[tokio::test]
    async fn test_fourth_waiter_rejected_without_mutation() {
        let queue = queue();
        queue.submit(exec("alpha", "running"), true).await.unwrap();
        for i in 0..MAX_QUEUE_SIZE {
            queue.submit(exec("alpha", &format!("w{i}")), true).await.unwrap();
        }

        let err = queue.submit(exec("alpha", "overflow"), true).await.unwrap_err();
        match err {
            Error::QueueFull { queue_length, .. } => assert_eq!(queue_length, MAX_QUEUE_SIZE),
            other => panic!("expected QueueFull, got {other:?}"),
        }
        // Queue untouched
        let status = queue.get_status("alpha").await.unwrap();
        assert_eq!(status.queue_length, MAX_QUEUE_SIZE);
    }

    #[tokio::test]
    async fn test_busy_without_wait_carries_current() {
        let queue = queue();
        let (_, running) = queue.submit(exec("alpha", "busy"), true).await.unwrap();
        let err = queue.submit(exec("alpha", "nope"), false).await.unwrap_err();
        match err {
            Error::AgentBusy {
                current_execution: Some(current),
                ..
            } => assert_eq!(current.id, running.id),
            other => panic!("expected AgentBusy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_promotes_fifo() {
        let queue = queue();
        queue.submit(exec("alpha", "running"), true).await.unwrap();
        let (_, first) = queue.submit(exec("alpha", "first waiter"), true).await.unwrap();
        let (_, second) = queue.submit(exec("alpha", "second waiter"), true).await.unwrap();

        let promoted = queue.complete("alpha", true).await.unwrap().unwrap();
        assert_eq!(promoted.id, first.id);
        assert_eq!(promoted.status, ExecutionStatus::Running);

        let promoted = queue.complete("alpha", true).await.unwrap().unwrap();
        assert_eq!(promoted.id, second.id);

        assert!(queue.complete("alpha", true).await.unwrap().is_none());
        assert!(!queue.is_busy("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_then_submit_runs() {
        let queue = queue();
        queue.submit(exec("alpha", "one"), true).await.unwrap();
        queue.complete("alpha", true).await.unwrap();
        let (outcome, _) = queue.submit(exec("alpha", "two"), false).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Running);
    }

    #[tokio::test]
    async fn test_clear_queue_keeps_running_slot() {
        let queue = queue();
        queue.submit(exec("alpha", "running"), true).await.unwrap();
        queue.submit(exec("alpha", "w1"), true).await.unwrap();
        queue.submit(exec("alpha", "w2"), true).await.unwrap();

        assert_eq!(queue.clear_queue("alpha").await.unwrap(), 2);
        let status = queue.get_status("alpha").await.unwrap();
        assert!(status.is_busy);
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn test_force_release_idle_is_noop() {
        let queue = queue();
        assert!(!queue.force_release("alpha").await.unwrap());

        queue.submit(exec("alpha", "running"), true).await.unwrap();
        assert!(queue.force_release("alpha").await.unwrap());
        assert!(!queue.is_busy("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_status_orders_waiters_oldest_first() {
        let queue = queue();
        queue.submit(exec("alpha", "running"), true).await.unwrap();
        let (_, w1) = queue.submit(exec("alpha", "w1"), true).await.unwrap();
        let (_, w2) = queue.submit(exec("alpha", "w2"), true).await.unwrap();

        let status = queue.get_status("alpha").await.unwrap();
        let ids: Vec<&str> = status
            .queued_executions
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ids, vec![w1.id.as_str(), w2.id.as_str()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_turn_unblocks_on_promotion() {
        let queue = queue();
        queue.submit(exec("alpha", "running"), true).await.unwrap();
        let (_, waiter) = queue.submit(exec("alpha", "waiting"), true).await.unwrap();

        let waiting_queue = queue.clone();
        let waiting = tokio::spawn(async move {
            waiting_queue
                .wait_for_turn(&waiter, QUEUE_WAIT_TIMEOUT)
                .await
        });

        queue.complete("alpha", true).await.unwrap();
        let promoted = waiting.await.unwrap().unwrap();
        assert_eq!(promoted.status, ExecutionStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_turn_times_out() {
        let queue = queue();
        queue.submit(exec("alpha", "running"), true).await.unwrap();
        let (_, waiter) = queue.submit(exec("alpha", "waiting"), true).await.unwrap();

        let err = queue
            .wait_for_turn(&waiter, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueTimeout { .. }));
    }

    #[tokio::test]
    async fn test_busy_agents_listing() {
        let queue = queue();
        queue.submit(exec("alpha", "x"), true).await.unwrap();
        queue.submit(exec("beta", "y"), true).await.unwrap();
        let mut busy = queue.get_all_busy_agents().await.unwrap();
        busy.sort();
        assert_eq!(busy, vec!["alpha", "beta"]);
    }
}
