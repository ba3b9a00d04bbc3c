//! Cron scheduler
//!
//! A tick loop over a min-heap of enabled schedules belonging to
//! autonomy-enabled agents. Only the leader instance dispatches, and
//! each due schedule is additionally guarded by a per-schedule
//! distributed lock, so no schedule ever runs concurrent copies even
//! with several workers alive.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use trinity_core::cron::{parse_timezone, CronExpression};
use trinity_core::sanitizer;
use trinity_core::types::{
    ActivityState, ActivityType, Execution, ExecutionSource, ExecutionStatus, Schedule,
    SubmitOutcome, TriggeredBy,
};
use trinity_core::{Error, Result};
use trinity_store::{ExecutionOutcome, StateStore};

use crate::activity::ActivityService;
use crate::locks::LockManager;
use crate::queue::{ExecutionQueue, QUEUE_WAIT_TIMEOUT};
use crate::transport::AgentTransport;

/// Wakeup cadence of the tick loop
pub const SCHEDULER_TICK: Duration = Duration::from_secs(15);

/// Observability snapshot of the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub instance_id: String,
    pub is_leader: bool,
    pub schedules_tracked: usize,
    pub next_wakeups: Vec<ScheduleWakeup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleWakeup {
    pub schedule_id: String,
    pub next_run_at: DateTime<Utc>,
}

/// Cron-driven task dispatcher
pub struct Scheduler {
    store: StateStore,
    queue: ExecutionQueue,
    locks: LockManager,
    transport: Arc<dyn AgentTransport>,
    activity: ActivityService,
    heap: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, String)>>>,
    leading: AtomicBool,
}

impl Scheduler {
    pub fn new(
        store: StateStore,
        queue: ExecutionQueue,
        locks: LockManager,
        transport: Arc<dyn AgentTransport>,
        activity: ActivityService,
    ) -> Self {
        Self {
            store,
            queue,
            locks,
            transport,
            activity,
            heap: Mutex::new(BinaryHeap::new()),
            leading: AtomicBool::new(false),
        }
    }

    /// Rebuild the heap from the store; returns schedules tracked
    ///
    /// Called on boot and after any schedule/autonomy mutation. A
    /// runnable schedule without a `next_run_at` gets one computed and
    /// persisted here.
    pub fn rebuild(&self) -> Result<usize> {
        let schedules = self.store.list_runnable_schedules()?;
        let mut heap = BinaryHeap::new();
        let now = Utc::now();

        for schedule in &schedules {
            let next_run_at = match schedule.next_run_at {
                Some(at) => at,
                None => match Self::compute_next_run(schedule, now) {
                    Some(at) => {
                        self.store.update_schedule(
                            &schedule.id,
                            trinity_store::ScheduleUpdate {
                                next_run_at: Some(Some(at)),
                                ..Default::default()
                            },
                        )?;
                        at
                    }
                    None => {
                        tracing::warn!(schedule = %schedule.id, "unschedulable cron, skipping");
                        continue;
                    }
                },
            };
            heap.push(Reverse((next_run_at, schedule.id.clone())));
        }

        let tracked = heap.len();
        *self.heap.lock() = heap;
        tracing::info!(tracked, "scheduler heap rebuilt");
        Ok(tracked)
    }

    /// React to an external mutation (schedule CRUD, autonomy flips,
    /// agent deletion)
    pub fn notify_changed(&self) {
        if let Err(e) = self.rebuild() {
            tracing::error!(error = %e, "scheduler rebuild failed");
        }
    }

    fn compute_next_run(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let cron = CronExpression::parse(&schedule.cron_expression).ok()?;
        let tz = parse_timezone(&schedule.timezone).ok()?;
        cron.next_after(after, tz)
    }

    /// One pass of the control loop
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) {
        if let Err(e) = self.locks.set_heartbeat().await {
            tracing::warn!(error = %e, "heartbeat write failed");
        }

        let leading = self.locks.try_lead().await.unwrap_or(false);
        self.leading.store(leading, Ordering::Relaxed);
        if !leading {
            return;
        }

        loop {
            let due_id = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(Reverse((at, _))) if *at <= now => {
                        heap.pop().map(|Reverse((_, id))| id)
                    }
                    _ => None,
                }
            };
            let Some(schedule_id) = due_id else { break };
            self.dispatch_due(&schedule_id, now).await;
        }
    }

    async fn dispatch_due(self: &Arc<Self>, schedule_id: &str, now: DateTime<Utc>) {
        let schedule = match self.store.get_schedule(schedule_id) {
            Ok(Some(schedule)) => schedule,
            Ok(None) => return, // deleted since it was queued
            Err(e) => {
                tracing::error!(schedule = %schedule_id, error = %e, "schedule load failed");
                return;
            }
        };

        // Revalidate against the store; the heap may be stale
        if !schedule.enabled {
            return;
        }
        match self.store.get_agent_record(&schedule.agent_name) {
            Ok(Some(record)) if record.autonomy_enabled => {}
            _ => return,
        }

        // Advance first so a lock-skip still converges across workers;
        // both peers compute the same next fire time.
        let next_run_at = Self::compute_next_run(&schedule, now);
        if let Err(e) = self.store.advance_schedule(schedule_id, now, next_run_at) {
            tracing::error!(schedule = %schedule_id, error = %e, "advance failed");
        }
        if let Some(at) = next_run_at {
            self.heap.lock().push(Reverse((at, schedule_id.to_string())));
        }

        let lock = match self.locks.try_acquire_schedule_lock(schedule_id).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                tracing::info!(schedule = %schedule_id, "skip, held by peer");
                return;
            }
            Err(e) => {
                tracing::warn!(schedule = %schedule_id, error = %e, "lock backend unavailable");
                return;
            }
        };

        self.run_schedule(&schedule, TriggeredBy::Schedule).await;

        if let Err(e) = lock.release().await {
            tracing::debug!(schedule = %schedule_id, error = %e, "lock release failed");
        }
    }

    /// Submit one firing of a schedule and see it through the queue
    pub async fn run_schedule(
        self: &Arc<Self>,
        schedule: &Schedule,
        triggered_by: TriggeredBy,
    ) -> Option<String> {
        let execution = Execution::new(
            &schedule.agent_name,
            &schedule.message,
            ExecutionSource::Schedule,
        );
        let execution_id = execution.id.clone();

        match self.queue.submit(execution, true).await {
            Ok((SubmitOutcome::Running, execution)) => {
                self.dispatch(schedule.clone(), execution, triggered_by).await;
                Some(execution_id)
            }
            Ok((SubmitOutcome::Queued(position), execution)) => {
                tracing::info!(
                    schedule = %schedule.id,
                    agent = %schedule.agent_name,
                    position,
                    "schedule firing queued behind running execution"
                );
                let this = Arc::clone(self);
                let schedule = schedule.clone();
                tokio::spawn(async move {
                    match this.queue.wait_for_turn(&execution, QUEUE_WAIT_TIMEOUT).await {
                        Ok(execution) => this.dispatch(schedule, execution, triggered_by).await,
                        Err(e) => {
                            tracing::warn!(schedule = %schedule.id, error = %e, "queued firing expired");
                            this.record_failed(&schedule, &execution.id, triggered_by, &e);
                        }
                    }
                });
                Some(execution_id)
            }
            Err(e) => {
                tracing::warn!(schedule = %schedule.id, error = %e, "schedule submit rejected");
                self.record_failed(schedule, &execution_id, triggered_by, &e);
                None
            }
        }
    }

    /// Record a firing that never reached the agent
    fn record_failed(
        &self,
        schedule: &Schedule,
        execution_id: &str,
        triggered_by: TriggeredBy,
        error: &Error,
    ) {
        let reason = match error {
            Error::QueueFull { .. } => "queue_full".to_string(),
            other => other.to_string(),
        };
        let recorded = self
            .store
            .create_execution(
                execution_id,
                Some(&schedule.id),
                &schedule.agent_name,
                &schedule.message,
                triggered_by,
            )
            .and_then(|_| {
                self.store.complete_execution(
                    execution_id,
                    ExecutionStatus::Failed,
                    ExecutionOutcome {
                        error: Some(reason),
                        ..Default::default()
                    },
                )
            });
        if let Err(e) = recorded {
            tracing::error!(schedule = %schedule.id, error = %e, "failed-execution record write failed");
        }
    }

    /// The dispatch pipeline for an execution holding the running slot
    async fn dispatch(&self, schedule: Schedule, execution: Execution, triggered_by: TriggeredBy) {
        let agent = schedule.agent_name.clone();

        if let Err(e) = self.store.create_execution(
            &execution.id,
            Some(&schedule.id),
            &agent,
            &schedule.message,
            triggered_by,
        ) {
            tracing::error!(execution = %execution.id, error = %e, "execution row write failed");
        }

        let activity_id = self
            .activity
            .track(
                &agent,
                ActivityType::ScheduleStart,
                triggered_by,
                None,
                Some(execution.id.clone()),
                serde_json::json!({"schedule_name": schedule.name, "schedule_id": schedule.id}),
            )
            .ok();

        let result = self
            .transport
            .task(&agent, &schedule.message, Some(&execution.id))
            .await;

        // The slot must be released whatever happened above
        let success = result.is_ok();
        match result {
            Ok(outcome) => {
                let response = sanitizer::sanitize_response(Some(&outcome.response));
                let log_json = outcome
                    .execution_log
                    .as_ref()
                    .map(|log| sanitizer::sanitize_value(log).to_string());
                let tool_calls_json = outcome.metadata.tool_calls.as_ref().map(|t| t.to_string());
                if let Err(e) = self.store.complete_execution(
                    &execution.id,
                    ExecutionStatus::Success,
                    ExecutionOutcome {
                        response,
                        context_used: outcome.metadata.input_tokens,
                        context_max: outcome.metadata.context_window,
                        cost: outcome.metadata.cost_usd,
                        tool_calls_json,
                        execution_log_json: log_json,
                        ..Default::default()
                    },
                ) {
                    tracing::error!(execution = %execution.id, error = %e, "completion write failed");
                }
                if let Some(activity_id) = activity_id {
                    let _ = self.activity.complete(
                        &activity_id,
                        ActivityState::Completed,
                        Some(serde_json::json!({
                            "context_used": outcome.metadata.input_tokens,
                            "context_max": outcome.metadata.context_window,
                            "cost": outcome.metadata.cost_usd,
                        })),
                        None,
                    );
                    if let Ok(end_id) = self.activity.track(
                        &agent,
                        ActivityType::ScheduleEnd,
                        triggered_by,
                        Some(activity_id),
                        Some(execution.id.clone()),
                        serde_json::json!({"schedule_name": schedule.name}),
                    ) {
                        let _ =
                            self.activity
                                .complete(&end_id, ActivityState::Completed, None, None);
                    }
                }
            }
            Err(e) => {
                let detail = e.to_string();
                tracing::warn!(execution = %execution.id, agent = %agent, error = %detail, "dispatch failed");
                if let Err(e) = self.store.complete_execution(
                    &execution.id,
                    ExecutionStatus::Failed,
                    ExecutionOutcome {
                        error: Some(detail.clone()),
                        ..Default::default()
                    },
                ) {
                    tracing::error!(execution = %execution.id, error = %e, "failure write failed");
                }
                if let Some(activity_id) = activity_id {
                    let _ = self.activity.complete(
                        &activity_id,
                        ActivityState::Failed,
                        None,
                        Some(&detail),
                    );
                }
            }
        }

        if let Err(e) = self.queue.complete(&agent, success).await {
            tracing::error!(agent = %agent, error = %e, "queue completion failed");
        }
    }

    /// Manual trigger of one schedule, outside its cron cadence
    pub async fn trigger(self: &Arc<Self>, schedule_id: &str) -> Result<String> {
        let schedule = self
            .store
            .get_schedule(schedule_id)?
            .ok_or_else(|| Error::NotFound(format!("schedule '{schedule_id}'")))?;
        self.run_schedule(&schedule, TriggeredBy::Manual)
            .await
            .ok_or_else(|| Error::Internal("trigger submission failed".to_string()))
    }

    /// Observability snapshot
    pub fn status(&self) -> SchedulerStatus {
        let heap = self.heap.lock();
        let mut wakeups: Vec<ScheduleWakeup> = heap
            .iter()
            .map(|Reverse((at, id))| ScheduleWakeup {
                schedule_id: id.clone(),
                next_run_at: *at,
            })
            .collect();
        wakeups.sort_by_key(|w| w.next_run_at);
        wakeups.truncate(5);

        SchedulerStatus {
            instance_id: self.locks.instance_id().to_string(),
            is_leader: self.leading.load(Ordering::Relaxed),
            schedules_tracked: heap.len(),
            next_wakeups: wakeups,
        }
    }

    /// The control loop; returns when `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if let Err(e) = self.rebuild() {
            tracing::error!(error = %e, "initial scheduler rebuild failed");
        }
        let mut interval = tokio::time::interval(SCHEDULER_TICK);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = self.locks.resign_leadership().await;
                        tracing::info!("scheduler stopped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KvBackend, MemoryBackend};
    use crate::test_support::FakeTransport;
    use trinity_store::NewSchedule;

    struct Harness {
        scheduler: Arc<Scheduler>,
        store: StateStore,
        queue: ExecutionQueue,
        transport: Arc<FakeTransport>,
        backend: Arc<MemoryBackend>,
    }

    fn harness() -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let store = StateStore::open_in_memory().unwrap();
        let queue = ExecutionQueue::new(backend.clone());
        let transport = Arc::new(FakeTransport::new());
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            queue.clone(),
            LockManager::new(backend.clone()),
            transport.clone() as Arc<dyn AgentTransport>,
            ActivityService::new(store.clone()),
        ));
        Harness {
            scheduler,
            store,
            queue,
            transport,
            backend,
        }
    }

    fn seed_schedule(h: &Harness, agent: &str, due: DateTime<Utc>) -> Schedule {
        h.store.register_agent_owner(agent, "ada", false).unwrap();
        h.store.set_autonomy_enabled(agent, true).unwrap();
        h.store
            .create_schedule(NewSchedule {
                agent_name: agent.to_string(),
                name: "nightly".to_string(),
                cron_expression: "* * * * *".to_string(),
                message: "do the rounds".to_string(),
                timezone: "UTC".to_string(),
                enabled: true,
                description: None,
                next_run_at: Some(due),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_rebuild_tracks_only_runnable() {
        let h = harness();
        seed_schedule(&h, "alpha", Utc::now());

        // A second schedule on a non-autonomous agent
        h.store.register_agent_owner("beta", "ada", false).unwrap();
        h.store
            .create_schedule(NewSchedule {
                agent_name: "beta".to_string(),
                name: "ignored".to_string(),
                cron_expression: "* * * * *".to_string(),
                message: "m".to_string(),
                timezone: "UTC".to_string(),
                enabled: true,
                description: None,
                next_run_at: Some(Utc::now()),
            })
            .unwrap();

        assert_eq!(h.scheduler.rebuild().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_due_schedule_dispatches() {
        let h = harness();
        let schedule = seed_schedule(&h, "alpha", Utc::now() - chrono::Duration::seconds(5));
        h.scheduler.rebuild().unwrap();

        let now = Utc::now();
        h.scheduler.tick(now).await;

        // The agent saw the task
        let calls = h.transport.task_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("alpha".to_string(), "do the rounds".to_string()));

        // Success row recorded, linked to the schedule
        let executions = h.store.list_schedule_executions(&schedule.id, 10).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Success);
        assert_eq!(executions[0].triggered_by, TriggeredBy::Schedule);

        // next_run_at advanced strictly past the tick
        let after = h.store.get_schedule(&schedule.id).unwrap().unwrap();
        assert!(after.next_run_at.unwrap() > now);
        assert!(after.last_run_at.is_some());

        // Queue slot released
        assert!(!h.queue.is_busy("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_not_due_schedule_waits() {
        let h = harness();
        seed_schedule(&h, "alpha", Utc::now() + chrono::Duration::hours(1));
        h.scheduler.rebuild().unwrap();
        h.scheduler.tick(Utc::now()).await;
        assert!(h.transport.task_calls().is_empty());
    }

    #[tokio::test]
    async fn test_peer_lock_skips_dispatch() {
        let h = harness();
        let schedule = seed_schedule(&h, "alpha", Utc::now() - chrono::Duration::seconds(5));
        h.scheduler.rebuild().unwrap();

        // A peer worker holds this schedule's lock
        h.backend
            .set_nx_ex(
                &format!("scheduler:lock:schedule:{}", schedule.id),
                "peer-token",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        h.scheduler.tick(Utc::now()).await;
        assert!(h.transport.task_calls().is_empty());

        // The schedule still advanced; the peer dispatches this firing
        let after = h.store.get_schedule(&schedule.id).unwrap().unwrap();
        assert!(after.next_run_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_transport_failure_records_failed_row() {
        let h = harness();
        let schedule = seed_schedule(&h, "alpha", Utc::now() - chrono::Duration::seconds(5));
        h.transport
            .push_task_response(Err("model exploded".to_string()));
        h.scheduler.rebuild().unwrap();

        h.scheduler.tick(Utc::now()).await;

        let executions = h.store.list_schedule_executions(&schedule.id, 10).unwrap();
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert!(executions[0].error.as_deref().unwrap().contains("model exploded"));
        // Slot released despite the failure
        assert!(!h.queue.is_busy("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_full_records_failed_row() {
        let h = harness();
        let schedule = seed_schedule(&h, "alpha", Utc::now());

        // Fill the slot and the whole wait list
        for i in 0..4 {
            let exec = Execution::new("alpha", format!("filler-{i}"), ExecutionSource::User);
            h.queue.submit(exec, true).await.unwrap();
        }

        h.scheduler.run_schedule(&schedule, TriggeredBy::Schedule).await;

        let executions = h.store.list_schedule_executions(&schedule.id, 10).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Failed);
        assert_eq!(executions[0].error.as_deref(), Some("queue_full"));
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let h = harness();
        let schedule = seed_schedule(&h, "alpha", Utc::now() + chrono::Duration::hours(1));

        let execution_id = h.scheduler.trigger(&schedule.id).await.unwrap();

        let row = h.store.get_execution(&execution_id).unwrap().unwrap();
        assert_eq!(row.triggered_by, TriggeredBy::Manual);
        assert_eq!(row.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_trigger_unknown_schedule() {
        let h = harness();
        assert!(h.scheduler.trigger("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_status_reports_heap() {
        let h = harness();
        seed_schedule(&h, "alpha", Utc::now() + chrono::Duration::hours(1));
        h.scheduler.rebuild().unwrap();
        let status = h.scheduler.status();
        assert_eq!(status.schedules_tracked, 1);
        assert_eq!(status.next_wakeups.len(), 1);
        assert!(!status.is_leader);
    }

    #[tokio::test]
    async fn test_disabled_schedule_dropped_at_dispatch() {
        let h = harness();
        let schedule = seed_schedule(&h, "alpha", Utc::now() - chrono::Duration::seconds(5));
        h.scheduler.rebuild().unwrap();
        h.store.set_schedule_enabled(&schedule.id, false).unwrap();

        h.scheduler.tick(Utc::now()).await;
        assert!(h.transport.task_calls().is_empty());
    }
}
