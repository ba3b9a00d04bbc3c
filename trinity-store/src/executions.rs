//! Execution outcome rows
//!
//! The queue's in-flight record lives in the lock backend; once an
//! execution starts, its authoritative outcome is written here.
//! `response` and `execution_log_json` must already be sanitized.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use trinity_core::types::{ExecutionStatus, ScheduleExecution, TriggeredBy};

use crate::store::{parse_opt_ts, parse_ts, ts, StateStore, StoreError, StoreResult};

/// Terminal fields written when an execution finishes
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub response: Option<String>,
    pub error: Option<String>,
    pub context_used: Option<i64>,
    pub context_max: Option<i64>,
    pub cost: Option<f64>,
    pub tool_calls_json: Option<String>,
    pub execution_log_json: Option<String>,
}

const COLS: &str = "id, schedule_id, agent_name, status, message, response, error, started_at, \
                    completed_at, duration_ms, triggered_by, context_used, context_max, cost, \
                    tool_calls_json, execution_log_json";

fn status_to_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Queued => "queued",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Success => "success",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Terminated => "terminated",
    }
}

fn status_from_str(raw: &str) -> StoreResult<ExecutionStatus> {
    match raw {
        "queued" => Ok(ExecutionStatus::Queued),
        "running" => Ok(ExecutionStatus::Running),
        "success" => Ok(ExecutionStatus::Success),
        "failed" => Ok(ExecutionStatus::Failed),
        "terminated" => Ok(ExecutionStatus::Terminated),
        other => Err(StoreError::Corrupt(format!("unknown execution status '{other}'"))),
    }
}

fn triggered_by_from_str(raw: &str) -> StoreResult<TriggeredBy> {
    match raw {
        "user" => Ok(TriggeredBy::User),
        "schedule" => Ok(TriggeredBy::Schedule),
        "agent" => Ok(TriggeredBy::Agent),
        "system" => Ok(TriggeredBy::System),
        "manual" => Ok(TriggeredBy::Manual),
        other => Err(StoreError::Corrupt(format!("unknown trigger '{other}'"))),
    }
}

type RawRow = (ScheduleExecution, String, String, Option<String>, String);

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        ScheduleExecution {
            id: row.get(0)?,
            schedule_id: row.get(1)?,
            agent_name: row.get(2)?,
            status: ExecutionStatus::Queued,
            message: row.get(4)?,
            response: row.get(5)?,
            error: row.get(6)?,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: row.get(9)?,
            triggered_by: TriggeredBy::User,
            context_used: row.get(11)?,
            context_max: row.get(12)?,
            cost: row.get(13)?,
            tool_calls_json: row.get(14)?,
            execution_log_json: row.get(15)?,
        },
        row.get::<_, String>(3)?,
        row.get::<_, String>(7)?,
        row.get::<_, Option<String>>(8)?,
        row.get::<_, String>(10)?,
    ))
}

fn finish(parts: RawRow) -> StoreResult<ScheduleExecution> {
    let (mut exec, status, started, completed, trigger) = parts;
    exec.status = status_from_str(&status)?;
    exec.started_at = parse_ts(&started)?;
    exec.completed_at = parse_opt_ts(completed)?;
    exec.triggered_by = triggered_by_from_str(&trigger)?;
    Ok(exec)
}

impl StateStore {
    /// Insert a `running` execution row
    ///
    /// `id` is the queue execution id so the two records correlate.
    pub fn create_execution(
        &self,
        id: &str,
        schedule_id: Option<&str>,
        agent_name: &str,
        message: &str,
        triggered_by: TriggeredBy,
    ) -> StoreResult<ScheduleExecution> {
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO schedule_executions
                     (id, schedule_id, agent_name, status, message, started_at, triggered_by)
                 VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?6)",
                params![
                    id,
                    schedule_id,
                    agent_name,
                    message,
                    ts(Utc::now()),
                    triggered_by.as_str(),
                ],
            )?;
        }
        Ok(self.get_execution(id)?.expect("row just inserted"))
    }

    /// Fetch one execution
    pub fn get_execution(&self, id: &str) -> StoreResult<Option<ScheduleExecution>> {
        let conn = self.lock();
        let found = conn
            .query_row(
                &format!("SELECT {COLS} FROM schedule_executions WHERE id = ?1"),
                params![id],
                row_to_execution,
            )
            .optional()?;
        found.map(finish).transpose()
    }

    /// Mark a running execution finished
    ///
    /// Stamps `completed_at` and derives `duration_ms` from `started_at`.
    /// Only `running` rows update, so a termination recorded first is not
    /// overwritten by the dispatcher's later failure path.
    pub fn complete_execution(
        &self,
        id: &str,
        status: ExecutionStatus,
        outcome: ExecutionOutcome,
    ) -> StoreResult<bool> {
        let completed_at = Utc::now();
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE schedule_executions SET
                 status = ?2,
                 response = ?3,
                 error = ?4,
                 completed_at = ?5,
                 duration_ms = CAST((julianday(?5) - julianday(started_at)) * 86400000 AS INTEGER),
                 context_used = ?6,
                 context_max = ?7,
                 cost = ?8,
                 tool_calls_json = ?9,
                 execution_log_json = ?10
             WHERE id = ?1 AND status = 'running'",
            params![
                id,
                status_to_str(status),
                outcome.response,
                outcome.error,
                ts(completed_at),
                outcome.context_used,
                outcome.context_max,
                outcome.cost,
                outcome.tool_calls_json,
                outcome.execution_log_json,
            ],
        )?;
        Ok(n > 0)
    }

    /// Recent executions of one schedule, newest first
    pub fn list_schedule_executions(
        &self,
        schedule_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<ScheduleExecution>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM schedule_executions
             WHERE schedule_id = ?1 ORDER BY started_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![schedule_id, limit as i64], row_to_execution)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish).collect()
    }

    /// Recent executions of one agent across all schedules, newest first
    pub fn list_agent_executions(
        &self,
        agent_name: &str,
        limit: usize,
    ) -> StoreResult<Vec<ScheduleExecution>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM schedule_executions
             WHERE agent_name = ?1 ORDER BY started_at DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![agent_name, limit as i64], row_to_execution)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_running_row() {
        let store = store();
        let exec = store
            .create_execution("e-1", None, "alpha", "hello", TriggeredBy::User)
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.schedule_id, None);
        assert_eq!(exec.triggered_by, TriggeredBy::User);
        assert!(exec.completed_at.is_none());
    }

    #[test]
    fn test_complete_with_outcome() {
        let store = store();
        store
            .create_execution("e-1", None, "alpha", "hello", TriggeredBy::User)
            .unwrap();
        let done = store
            .complete_execution(
                "e-1",
                ExecutionStatus::Success,
                ExecutionOutcome {
                    response: Some("hi there".to_string()),
                    context_used: Some(1200),
                    context_max: Some(200000),
                    cost: Some(0.012),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(done);

        let exec = store.get_execution("e-1").unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.response.as_deref(), Some("hi there"));
        assert!(exec.completed_at.is_some());
        assert!(exec.duration_ms.unwrap() >= 0);
        assert_eq!(exec.context_used, Some(1200));
    }

    #[test]
    fn test_complete_missing_returns_false() {
        assert!(!store()
            .complete_execution("ghost", ExecutionStatus::Failed, ExecutionOutcome::default())
            .unwrap());
    }

    #[test]
    fn test_terminated_status_round_trips() {
        let store = store();
        store
            .create_execution("e-1", None, "alpha", "long job", TriggeredBy::User)
            .unwrap();
        store
            .complete_execution(
                "e-1",
                ExecutionStatus::Terminated,
                ExecutionOutcome {
                    error: Some("cancelled by user".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let exec = store.get_execution("e-1").unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Terminated);

        // A late failure path cannot overwrite the terminal status
        let overwrote = store
            .complete_execution(
                "e-1",
                ExecutionStatus::Failed,
                ExecutionOutcome {
                    error: Some("agent unreachable".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!overwrote);
        let exec = store.get_execution("e-1").unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Terminated);
    }

    #[test]
    fn test_listings_newest_first_with_limit() {
        let store = store();
        for i in 0..5 {
            store
                .create_execution(&format!("e-{i}"), None, "alpha", "msg", TriggeredBy::User)
                .unwrap();
        }
        let listed = store.list_agent_executions("alpha", 3).unwrap();
        assert_eq!(listed.len(), 3);
        assert!(store.list_agent_executions("other", 10).unwrap().is_empty());
    }

    #[test]
    fn test_schedule_link_survives_schedule_delete() {
        let store = store();
        store.register_agent_owner("alpha", "ada", false).unwrap();
        let schedule = store
            .create_schedule(crate::schedules::NewSchedule {
                agent_name: "alpha".to_string(),
                name: "s".to_string(),
                cron_expression: "* * * * *".to_string(),
                message: "m".to_string(),
                timezone: "UTC".to_string(),
                enabled: true,
                description: None,
                next_run_at: None,
            })
            .unwrap();
        store
            .create_execution("e-1", Some(&schedule.id), "alpha", "m", TriggeredBy::Schedule)
            .unwrap();

        store.delete_schedule(&schedule.id).unwrap();

        // Row remains, link nulled out
        let exec = store.get_execution("e-1").unwrap().unwrap();
        assert_eq!(exec.schedule_id, None);
    }
}
