//! Schedule rows
//!
//! Cron validity is checked before anything lands here; the store holds
//! the expression verbatim and the precomputed `next_run_at`.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use trinity_core::types::Schedule;
use uuid::Uuid;

use crate::store::{parse_opt_ts, parse_ts, ts, StateStore, StoreResult};

/// Fields accepted when creating a schedule
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub agent_name: String,
    pub name: String,
    pub cron_expression: String,
    pub message: String,
    pub timezone: String,
    pub enabled: bool,
    pub description: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Partial update for a schedule; `None` leaves the field untouched
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub message: Option<String>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
    pub description: Option<String>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
}

const COLS: &str = "id, agent_name, name, cron_expression, message, timezone, enabled, \
                    description, created_at, updated_at, last_run_at, next_run_at";

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<(Schedule, String, String, Option<String>, Option<String>)> {
    Ok((
        Schedule {
            id: row.get(0)?,
            agent_name: row.get(1)?,
            name: row.get(2)?,
            cron_expression: row.get(3)?,
            message: row.get(4)?,
            timezone: row.get(5)?,
            enabled: row.get(6)?,
            description: row.get(7)?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_at: None,
            next_run_at: None,
        },
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn finish(
    parts: (Schedule, String, String, Option<String>, Option<String>),
) -> StoreResult<Schedule> {
    let (mut schedule, created, updated, last_run, next_run) = parts;
    schedule.created_at = parse_ts(&created)?;
    schedule.updated_at = parse_ts(&updated)?;
    schedule.last_run_at = parse_opt_ts(last_run)?;
    schedule.next_run_at = parse_opt_ts(next_run)?;
    Ok(schedule)
}

impl StateStore {
    /// Insert a schedule and return the stored row
    pub fn create_schedule(&self, new: NewSchedule) -> StoreResult<Schedule> {
        let id = Uuid::new_v4().to_string();
        let now = ts(Utc::now());
        {
            let conn = self.lock();
            conn.execute(
                "INSERT INTO schedules
                     (id, agent_name, name, cron_expression, message, timezone, enabled,
                      description, created_at, updated_at, next_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10)",
                params![
                    id,
                    new.agent_name,
                    new.name,
                    new.cron_expression,
                    new.message,
                    new.timezone,
                    new.enabled,
                    new.description,
                    now,
                    new.next_run_at.map(ts),
                ],
            )?;
        }
        Ok(self.get_schedule(&id)?.expect("row just inserted"))
    }

    /// Fetch one schedule
    pub fn get_schedule(&self, id: &str) -> StoreResult<Option<Schedule>> {
        let conn = self.lock();
        let found = conn
            .query_row(
                &format!("SELECT {COLS} FROM schedules WHERE id = ?1"),
                params![id],
                row_to_schedule,
            )
            .optional()?;
        found.map(finish).transpose()
    }

    /// All schedules of one agent
    pub fn list_agent_schedules(&self, agent_name: &str) -> StoreResult<Vec<Schedule>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLS} FROM schedules WHERE agent_name = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![agent_name], row_to_schedule)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish).collect()
    }

    /// Enabled schedules belonging to autonomy-enabled agents
    ///
    /// This is the scheduler's boot query; the heap is rebuilt from it.
    pub fn list_runnable_schedules(&self) -> StoreResult<Vec<Schedule>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.agent_name, s.name, s.cron_expression, s.message, s.timezone,
                    s.enabled, s.description, s.created_at, s.updated_at, s.last_run_at,
                    s.next_run_at
             FROM schedules s JOIN agents a ON a.name = s.agent_name
             WHERE s.enabled = 1 AND a.autonomy_enabled = 1
             ORDER BY s.next_run_at",
        )?;
        let rows = stmt
            .query_map([], row_to_schedule)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(finish).collect()
    }

    /// Apply a partial update and return the new row
    pub fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> StoreResult<Option<Schedule>> {
        {
            let conn = self.lock();
            let n = conn.execute(
                "UPDATE schedules SET
                     name = COALESCE(?2, name),
                     cron_expression = COALESCE(?3, cron_expression),
                     message = COALESCE(?4, message),
                     timezone = COALESCE(?5, timezone),
                     enabled = COALESCE(?6, enabled),
                     description = COALESCE(?7, description),
                     updated_at = ?8
                 WHERE id = ?1",
                params![
                    id,
                    update.name,
                    update.cron_expression,
                    update.message,
                    update.timezone,
                    update.enabled,
                    update.description,
                    ts(Utc::now()),
                ],
            )?;
            if n == 0 {
                return Ok(None);
            }
            if let Some(next_run_at) = update.next_run_at {
                conn.execute(
                    "UPDATE schedules SET next_run_at = ?2 WHERE id = ?1",
                    params![id, next_run_at.map(ts)],
                )?;
            }
        }
        self.get_schedule(id)
    }

    /// Record one firing: advance `next_run_at`, stamp `last_run_at`
    pub fn advance_schedule(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE schedules SET last_run_at = ?2, next_run_at = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, ts(last_run_at), next_run_at.map(ts), ts(Utc::now())],
        )?;
        Ok(n > 0)
    }

    /// Enable or disable a schedule
    pub fn set_schedule_enabled(&self, id: &str, enabled: bool) -> StoreResult<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE schedules SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, enabled, ts(Utc::now())],
        )?;
        Ok(n > 0)
    }

    /// Delete a schedule
    pub fn delete_schedule(&self, id: &str) -> StoreResult<bool> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}
