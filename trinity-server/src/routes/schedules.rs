//! Schedule CRUD and control

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use trinity_core::cron::{parse_timezone, CronExpression};
use trinity_core::types::Schedule;
use trinity_core::Error;
use trinity_store::{NewSchedule, ScheduleUpdate};

use crate::auth::Actor;
use crate::error::ApiResult;
use crate::routes::executions::HistoryQuery;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateScheduleBody {
    pub name: String,
    pub cron_expression: String,
    pub message: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateScheduleBody {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub message: Option<String>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
    pub description: Option<String>,
}

fn load_owned_schedule(state: &AppState, agent: &str, schedule_id: &str) -> ApiResult<Schedule> {
    state
        .store
        .get_schedule(schedule_id)?
        .filter(|s| s.agent_name == agent)
        .ok_or_else(|| Error::NotFound(format!("schedule '{schedule_id}'")).into())
}

/// `GET /api/agents/{name}/schedules`
pub async fn list_schedules(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<Vec<Schedule>>> {
    actor.authorize_agent(&state, &name)?;
    Ok(Json(state.store.list_agent_schedules(&name)?))
}

/// `POST /api/agents/{name}/schedules` - cron validated at write time
pub async fn create_schedule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
    Json(body): Json<CreateScheduleBody>,
) -> ApiResult<Json<Schedule>> {
    actor.authorize_agent(&state, &name)?;

    let cron = CronExpression::parse(&body.cron_expression)?;
    let tz = parse_timezone(&body.timezone)?;
    let next_run_at = cron.next_after(chrono::Utc::now(), tz);

    let schedule = state.store.create_schedule(NewSchedule {
        agent_name: name,
        name: body.name,
        cron_expression: cron.as_str().to_string(),
        message: body.message,
        timezone: body.timezone,
        enabled: body.enabled,
        description: body.description,
        next_run_at,
    })?;
    state.scheduler.notify_changed();
    Ok(Json(schedule))
}

/// `GET /api/agents/{name}/schedules/{id}`
pub async fn get_schedule(
    State(state): State<AppState>,
    Path((name, schedule_id)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<Schedule>> {
    actor.authorize_agent(&state, &name)?;
    Ok(Json(load_owned_schedule(&state, &name, &schedule_id)?))
}

/// `PUT /api/agents/{name}/schedules/{id}`
pub async fn update_schedule(
    State(state): State<AppState>,
    Path((name, schedule_id)): Path<(String, String)>,
    actor: Actor,
    Json(body): Json<UpdateScheduleBody>,
) -> ApiResult<Json<Schedule>> {
    actor.authorize_agent(&state, &name)?;
    let existing = load_owned_schedule(&state, &name, &schedule_id)?;

    // Re-derive next_run_at when cron or timezone change
    let cron_expression = match &body.cron_expression {
        Some(expression) => Some(CronExpression::parse(expression)?.as_str().to_string()),
        None => None,
    };
    let timezone = match &body.timezone {
        Some(timezone) => {
            parse_timezone(timezone)?;
            Some(timezone.clone())
        }
        None => None,
    };
    let next_run_at = if cron_expression.is_some() || timezone.is_some() {
        let cron = CronExpression::parse(
            cron_expression.as_deref().unwrap_or(&existing.cron_expression),
        )?;
        let tz = parse_timezone(timezone.as_deref().unwrap_or(&existing.timezone))?;
        Some(cron.next_after(chrono::Utc::now(), tz))
    } else {
        None
    };

    let updated = state
        .store
        .update_schedule(
            &schedule_id,
            ScheduleUpdate {
                name: body.name,
                cron_expression,
                message: body.message,
                timezone,
                enabled: body.enabled,
                description: body.description,
                next_run_at,
            },
        )?
        .ok_or_else(|| Error::NotFound(format!("schedule '{schedule_id}'")))?;
    state.scheduler.notify_changed();
    Ok(Json(updated))
}

/// `DELETE /api/agents/{name}/schedules/{id}`
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path((name, schedule_id)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    load_owned_schedule(&state, &name, &schedule_id)?;
    state.store.delete_schedule(&schedule_id)?;
    state.scheduler.notify_changed();
    Ok(Json(serde_json::json!({"status": "deleted", "schedule_id": schedule_id})))
}

/// `POST /api/agents/{name}/schedules/{id}/enable`
pub async fn enable_schedule(
    State(state): State<AppState>,
    Path((name, schedule_id)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    set_enabled(state, name, schedule_id, actor, true).await
}

/// `POST /api/agents/{name}/schedules/{id}/disable`
pub async fn disable_schedule(
    State(state): State<AppState>,
    Path((name, schedule_id)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    set_enabled(state, name, schedule_id, actor, false).await
}

async fn set_enabled(
    state: AppState,
    name: String,
    schedule_id: String,
    actor: Actor,
    enabled: bool,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    load_owned_schedule(&state, &name, &schedule_id)?;
    state.store.set_schedule_enabled(&schedule_id, enabled)?;
    state.scheduler.notify_changed();
    Ok(Json(serde_json::json!({
        "status": if enabled { "enabled" } else { "disabled" },
        "schedule_id": schedule_id,
    })))
}

/// `POST /api/agents/{name}/schedules/{id}/trigger` - manual firing
pub async fn trigger_schedule(
    State(state): State<AppState>,
    Path((name, schedule_id)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    load_owned_schedule(&state, &name, &schedule_id)?;
    let execution_id = state.scheduler.trigger(&schedule_id).await?;
    Ok(Json(serde_json::json!({
        "status": "triggered",
        "schedule_id": schedule_id,
        "execution_id": execution_id,
    })))
}

/// `GET /api/agents/{name}/schedules/{id}/executions`
pub async fn schedule_executions(
    State(state): State<AppState>,
    Path((name, schedule_id)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
    actor: Actor,
) -> ApiResult<Json<Vec<trinity_core::ScheduleExecution>>> {
    actor.authorize_agent(&state, &name)?;
    load_owned_schedule(&state, &name, &schedule_id)?;
    Ok(Json(state.store.list_schedule_executions(&schedule_id, query.limit)?))
}

/// `GET /api/scheduler/status`
pub async fn scheduler_status(
    State(state): State<AppState>,
    _actor: Actor,
) -> ApiResult<Json<trinity_runtime::SchedulerStatus>> {
    Ok(Json(state.scheduler.status()))
}
