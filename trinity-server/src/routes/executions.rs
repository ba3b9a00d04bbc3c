//! Task submission, queue introspection and execution history

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use trinity_core::sanitizer;
use trinity_core::types::{
    ActivityState, ActivityType, Execution, ExecutionSource, ExecutionStatus, QueueStatus,
    SubmitOutcome, TriggeredBy,
};
use trinity_core::Error;
use trinity_runtime::{TerminationStatus, QUEUE_WAIT_TIMEOUT};
use trinity_store::ExecutionOutcome;

use crate::auth::Actor;
use crate::error::ApiResult;
use crate::state::AppState;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct TaskBody {
    pub message: String,
    #[serde(default = "default_true")]
    pub wait_if_busy: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// `POST /api/agents/{name}/task` (alias `/chat`)
///
/// Submits through the queue and blocks for the agent's turn: 200 on
/// completion, 409 when busy and the caller disallowed waiting, 429
/// with Retry-After when the wait list is full, 503 when the agent is
/// unreachable.
pub async fn submit_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
    Json(body): Json<TaskBody>,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;

    // Agent-to-agent dispatch goes through the permission graph
    let (source, triggered_by) = match actor.acting_agent() {
        Some(source_agent) => {
            if !actor.is_system_scoped() && !state.resolver.can_dispatch(source_agent, &name)? {
                return Err(Error::Permission(format!(
                    "agent '{source_agent}' may not dispatch to '{name}'"
                ))
                .into());
            }
            (ExecutionSource::Agent, TriggeredBy::Agent)
        }
        None => (ExecutionSource::User, TriggeredBy::User),
    };

    let mut execution = Execution::new(&name, &body.message, source);
    if let Some(source_agent) = actor.acting_agent() {
        execution = execution.from_agent(source_agent);
    } else {
        execution = execution.from_user(actor.username());
    }

    let (outcome, execution) = state.queue.submit(execution, body.wait_if_busy).await?;
    let execution = match outcome {
        SubmitOutcome::Running => execution,
        SubmitOutcome::Queued(position) => {
            tracing::info!(agent = %name, position, "task parked in wait list");
            state
                .queue
                .wait_for_turn(&execution, QUEUE_WAIT_TIMEOUT)
                .await?
        }
    };

    let response = dispatch(&state, &name, execution, triggered_by).await?;
    Ok(Json(response))
}

/// Run one execution that holds the queue slot, recording everything
async fn dispatch(
    state: &AppState,
    agent: &str,
    execution: Execution,
    triggered_by: TriggeredBy,
) -> ApiResult<serde_json::Value> {
    state.store.create_execution(
        &execution.id,
        None,
        agent,
        &execution.message,
        triggered_by,
    )?;

    let start_type = match triggered_by {
        TriggeredBy::Agent => ActivityType::AgentCollaboration,
        _ => ActivityType::ChatStart,
    };
    let preview: String = execution.message.chars().take(100).collect();
    let activity_id = state.activity.track(
        agent,
        start_type,
        triggered_by,
        None,
        Some(execution.id.clone()),
        serde_json::json!({
            "message_preview": preview,
            "source_agent": execution.source_agent,
        }),
    )?;

    let result = state
        .lifecycle
        .transport()
        .task(agent, &execution.message, Some(&execution.id))
        .await;
    let success = result.is_ok();

    let response = match &result {
        Ok(outcome) => {
            let response = sanitizer::sanitize_response(Some(&outcome.response));
            let log_json = outcome
                .execution_log
                .as_ref()
                .map(|log| sanitizer::sanitize_value(log).to_string());
            state.store.complete_execution(
                &execution.id,
                ExecutionStatus::Success,
                ExecutionOutcome {
                    response: response.clone(),
                    context_used: outcome.metadata.input_tokens,
                    context_max: outcome.metadata.context_window,
                    cost: outcome.metadata.cost_usd,
                    tool_calls_json: outcome.metadata.tool_calls.as_ref().map(|t| t.to_string()),
                    execution_log_json: log_json,
                    ..Default::default()
                },
            )?;
            state.activity.complete(
                &activity_id,
                ActivityState::Completed,
                Some(serde_json::json!({"cost": outcome.metadata.cost_usd})),
                None,
            )?;
            if start_type == ActivityType::ChatStart {
                let end_id = state.activity.track(
                    agent,
                    ActivityType::ChatEnd,
                    triggered_by,
                    Some(activity_id.clone()),
                    Some(execution.id.clone()),
                    serde_json::json!({}),
                )?;
                state
                    .activity
                    .complete(&end_id, ActivityState::Completed, None, None)?;
            }
            serde_json::json!({
                "status": "success",
                "execution_id": execution.id,
                "response": response,
            })
        }
        Err(e) => {
            let detail = e.to_string();
            state.store.complete_execution(
                &execution.id,
                ExecutionStatus::Failed,
                ExecutionOutcome {
                    error: Some(detail.clone()),
                    ..Default::default()
                },
            )?;
            state
                .activity
                .complete(&activity_id, ActivityState::Failed, None, Some(&detail))?;
            serde_json::Value::Null
        }
    };

    // The slot is released whatever happened; the next waiter's poll
    // picks the promotion up.
    state.queue.complete(agent, success).await?;

    match result {
        Ok(_) => Ok(response),
        Err(e) => Err(Error::from(e).into()),
    }
}

/// `GET /api/agents/{name}/queue`
pub async fn queue_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<QueueStatus>> {
    actor.authorize_agent(&state, &name)?;
    Ok(Json(state.queue.get_status(&name).await?))
}

/// `POST /api/agents/{name}/queue/clear` - drop waiters, keep the slot
pub async fn clear_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let cleared = state.queue.clear_queue(&name).await?;
    Ok(Json(serde_json::json!({"status": "cleared", "dropped": cleared})))
}

/// `POST /api/agents/{name}/queue/release` - administrative emergency
/// break for a dead container's slot
pub async fn force_release(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let existed = state.queue.force_release(&name).await?;
    Ok(Json(serde_json::json!({"status": "released", "existed": existed})))
}

/// `GET /api/agents/{name}/executions/running` - the live queue record
pub async fn running_execution(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let current = state.queue.current_execution(&name).await?;
    Ok(Json(serde_json::json!({"agent_name": name, "execution": current})))
}

/// `GET /api/agents/{name}/executions`
pub async fn list_executions(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
    actor: Actor,
) -> ApiResult<Json<Vec<trinity_core::ScheduleExecution>>> {
    actor.authorize_agent(&state, &name)?;
    Ok(Json(state.store.list_agent_executions(&name, query.limit)?))
}

/// `GET /api/agents/{name}/executions/{id}`
pub async fn get_execution(
    State(state): State<AppState>,
    Path((name, execution_id)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<trinity_core::ScheduleExecution>> {
    actor.authorize_agent(&state, &name)?;
    let execution = state
        .store
        .get_execution(&execution_id)?
        .filter(|e| e.agent_name == name)
        .ok_or_else(|| Error::NotFound(format!("execution '{execution_id}'")))?;
    Ok(Json(execution))
}

/// `GET /api/agents/{name}/executions/{id}/log` - full transcript
pub async fn get_execution_log(
    State(state): State<AppState>,
    Path((name, execution_id)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let execution = state
        .store
        .get_execution(&execution_id)?
        .filter(|e| e.agent_name == name)
        .ok_or_else(|| Error::NotFound(format!("execution '{execution_id}'")))?;

    let log = match execution.execution_log_json.as_deref() {
        None => {
            return Ok(Json(serde_json::json!({
                "execution_id": execution_id,
                "has_log": false,
                "log": null,
            })))
        }
        Some(raw) => serde_json::from_str::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
    };

    Ok(Json(serde_json::json!({
        "execution_id": execution_id,
        "agent_name": name,
        "has_log": true,
        "log": log,
        "started_at": execution.started_at,
        "completed_at": execution.completed_at,
        "status": execution.status,
    })))
}

/// `POST /api/agents/{name}/executions/{id}/terminate`
pub async fn terminate_execution(
    State(state): State<AppState>,
    Path((name, execution_id)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let status = state
        .lifecycle
        .terminate_execution(&name, &execution_id)
        .await?;
    let status = match status {
        TerminationStatus::Terminated => "terminated",
        TerminationStatus::AlreadyFinished => "already_finished",
    };
    Ok(Json(serde_json::json!({"status": status, "execution_id": execution_id})))
}

/// `GET /api/agents/{name}/activities`
pub async fn list_activities(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
    actor: Actor,
) -> ApiResult<Json<Vec<trinity_core::Activity>>> {
    actor.authorize_agent(&state, &name)?;
    Ok(Json(state.activity.recent(&name, query.limit)?))
}

/// `GET /api/agents/{name}/activities/current`
pub async fn current_activities(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<Vec<trinity_core::Activity>>> {
    actor.authorize_agent(&state, &name)?;
    Ok(Json(state.activity.current(&name)?))
}
