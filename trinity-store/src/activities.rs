//! Activity timeline rows

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use trinity_core::types::{Activity, ActivityState, ActivityType, TriggeredBy};
use uuid::Uuid;

use crate::store::{parse_opt_ts, parse_ts, ts, StateStore, StoreError, StoreResult};

/// Fields for a new activity; state starts as `started`
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub agent_name: String,
    pub activity_type: ActivityType,
    pub triggered_by: TriggeredBy,
    pub parent_activity_id: Option<String>,
    pub related_execution_id: Option<String>,
    pub details: serde_json::Value,
}

const COLS: &str = "id, agent_name, activity_type, activity_state, parent_activity_id, \
                    triggered_by, related_execution_id, details, created_at, completed_at, error";

fn type_from_str(raw: &str) -> StoreResult<ActivityType> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| StoreError::Corrupt(format!("unknown activity type '{raw}'")))
}

fn state_from_str(raw: &str) -> StoreResult<ActivityState> {
    match raw {
        "started" => Ok(ActivityState::Started),
        "completed" => Ok(ActivityState::Completed),
        "failed" => Ok(ActivityState::Failed),
        other => Err(StoreError::Corrupt(format!("unknown activity state '{other}'"))),
    }
}

fn state_to_str(state: ActivityState) -> &'static str {
    match state {
        ActivityState::Started => "started",
        ActivityState::Completed => "completed",
        ActivityState::Failed => "failed",
    }
}

fn trigger_from_str(raw: &str) -> StoreResult<TriggeredBy> {
    match raw {
        "user" => Ok(TriggeredBy::User),
        "schedule" => Ok(TriggeredBy::Schedule),
        "agent" => Ok(TriggeredBy::Agent),
        "system" => Ok(TriggeredBy::System),
        "manual" => Ok(TriggeredBy::Manual),
        other => Err(StoreError::Corrupt(format!("unknown trigger '{other}'"))),
    }
}

type RawRow = (Activity, String, String, String, String, Option<String>);

fn row_to_activity(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        Activity {
            id: row.get(0)?,
            agent_name: row.get(1)?,
            activity_type: ActivityType::ChatStart,
            activity_state: ActivityState::Started,
            parent_activity_id: row.get(4)?,
            triggered_by: TriggeredBy::User,
            related_execution_id: row.get(6)?,
            details: serde_json::Value::Null,
            created_at: Utc::now(),
            completed_at: None,
            error: row.get(10)?,
        },
        row.get::<_, String>(2)?,
        row.get::<_, String>(3)?,
        row.get::<_, String>(5)?,
        row.get::<_, String>(7)?,
        row.get::<_, Option<String>>(9)?,
    ))
}

fn finish(parts: RawRow, created_raw: String) -> StoreResult<Activity> {
    let (mut activity, type_raw, state_raw, trigger_raw, details_raw, completed_raw) = parts;
    activity.activity_type = type_from_str(&type_raw)?;
    activity.activity_state = state_from_str(&state_raw)?;
    activity.triggered_by = trigger_from_str(&trigger_raw)?;
    activity.details = serde_json::from_str(&details_raw)
        .map_err(|e| StoreError::Corrupt(format!("activity details: {e}")))?;
    activity.created_at = parse_ts(&created_raw)?;
    activity.completed_at = parse_opt_ts(completed_raw)?;
    Ok(activity)
}

impl StateStore {
    /// Insert a `started` activity and return its id
    pub fn create_activity(&self, new: NewActivity) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let type_str = serde_json::to_value(new.activity_type)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO activities
                 (id, agent_name, activity_type, activity_state, parent_activity_id,
                  triggered_by, related_execution_id, details, created_at)
             VALUES (?1, ?2, ?3, 'started', ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                new.agent_name,
                type_str,
                new.parent_activity_id,
                new.triggered_by.as_str(),
                new.related_execution_id,
                new.details.to_string(),
                ts(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    /// Fetch one activity
    pub fn get_activity(&self, id: &str) -> StoreResult<Option<Activity>> {
        let conn = self.lock();
        let found = conn
            .query_row(
                &format!("SELECT {COLS} FROM activities WHERE id = ?1"),
                params![id],
                |row| {
                    let created_raw: String = row.get(8)?;
                    row_to_activity(row).map(|parts| (parts, created_raw))
                },
            )
            .optional()?;
        found.map(|(parts, created)| finish(parts, created)).transpose()
    }

    /// Mark an activity completed or failed, merging extra details
    pub fn complete_activity(
        &self,
        id: &str,
        state: ActivityState,
        details: Option<serde_json::Value>,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let Some(existing) = self.get_activity(id)? else {
            return Ok(false);
        };
        let merged = match (existing.details, details) {
            (serde_json::Value::Object(mut base), Some(serde_json::Value::Object(extra))) => {
                base.extend(extra);
                serde_json::Value::Object(base)
            }
            (base, Some(extra)) if base.is_null() => extra,
            (base, _) => base,
        };

        let conn = self.lock();
        let n = conn.execute(
            "UPDATE activities SET activity_state = ?2, details = ?3, completed_at = ?4, error = ?5
             WHERE id = ?1",
            params![id, state_to_str(state), merged.to_string(), ts(Utc::now()), error],
        )?;
        Ok(n > 0)
    }

    /// Recent activities for an agent, newest first
    pub fn list_agent_activities(&self, agent_name: &str, limit: usize) -> StoreResult<Vec<Activity>> {
        self.query_activities(
            &format!(
                "SELECT {COLS} FROM activities WHERE agent_name = ?1
                 ORDER BY created_at DESC LIMIT ?2"
            ),
            agent_name,
            limit,
        )
    }

    /// Activities still in `started` state for an agent
    pub fn list_current_activities(&self, agent_name: &str) -> StoreResult<Vec<Activity>> {
        self.query_activities(
            &format!(
                "SELECT {COLS} FROM activities
                 WHERE agent_name = ?1 AND activity_state = 'started'
                 ORDER BY created_at DESC LIMIT ?2"
            ),
            agent_name,
            100,
        )
    }

    fn query_activities(&self, sql: &str, agent: &str, limit: usize) -> StoreResult<Vec<Activity>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![agent, limit as i64], |row| {
                let created_raw: String = row.get(8)?;
                row_to_activity(row).map(|parts| (parts, created_raw))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(parts, created)| finish(parts, created))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_activity(agent: &str) -> NewActivity {
        NewActivity {
            agent_name: agent.to_string(),
            activity_type: ActivityType::ChatStart,
            triggered_by: TriggeredBy::User,
            parent_activity_id: None,
            related_execution_id: Some("e-1".to_string()),
            details: json!({"message_preview": "hello"}),
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.create_activity(new_activity("alpha")).unwrap();
        let activity = store.get_activity(&id).unwrap().unwrap();
        assert_eq!(activity.activity_type, ActivityType::ChatStart);
        assert_eq!(activity.activity_state, ActivityState::Started);
        assert_eq!(activity.related_execution_id.as_deref(), Some("e-1"));
        assert_eq!(activity.details["message_preview"], "hello");
    }

    #[test]
    fn test_complete_merges_details() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.create_activity(new_activity("alpha")).unwrap();
        assert!(store
            .complete_activity(
                &id,
                ActivityState::Completed,
                Some(json!({"duration_ms": 1500})),
                None,
            )
            .unwrap());
        let activity = store.get_activity(&id).unwrap().unwrap();
        assert_eq!(activity.activity_state, ActivityState::Completed);
        assert_eq!(activity.details["message_preview"], "hello");
        assert_eq!(activity.details["duration_ms"], 1500);
        assert!(activity.completed_at.is_some());
    }

    #[test]
    fn test_complete_failed_records_error() {
        let store = StateStore::open_in_memory().unwrap();
        let id = store.create_activity(new_activity("alpha")).unwrap();
        store
            .complete_activity(&id, ActivityState::Failed, None, Some("agent unreachable"))
            .unwrap();
        let activity = store.get_activity(&id).unwrap().unwrap();
        assert_eq!(activity.activity_state, ActivityState::Failed);
        assert_eq!(activity.error.as_deref(), Some("agent unreachable"));
    }

    #[test]
    fn test_complete_missing_returns_false() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!store
            .complete_activity("ghost", ActivityState::Completed, None, None)
            .unwrap());
    }

    #[test]
    fn test_current_excludes_finished() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.create_activity(new_activity("alpha")).unwrap();
        let _b = store.create_activity(new_activity("alpha")).unwrap();
        store
            .complete_activity(&a, ActivityState::Completed, None, None)
            .unwrap();
        assert_eq!(store.list_current_activities("alpha").unwrap().len(), 1);
        assert_eq!(store.list_agent_activities("alpha", 10).unwrap().len(), 2);
    }
}
