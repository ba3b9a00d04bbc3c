//! Internal activity API
//!
//! Used by scheduler workers and agent-side reporters on the internal
//! network; carries no auth by design.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use trinity_core::types::{ActivityState, ActivityType, TriggeredBy};
use trinity_core::Error;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TrackActivityBody {
    pub agent_name: String,
    pub activity_type: ActivityType,
    #[serde(default = "default_triggered_by")]
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub parent_activity_id: Option<String>,
    #[serde(default)]
    pub related_execution_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

fn default_triggered_by() -> TriggeredBy {
    TriggeredBy::System
}

#[derive(Debug, Deserialize)]
pub struct CompleteActivityBody {
    #[serde(default = "default_state")]
    pub status: ActivityState,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_state() -> ActivityState {
    ActivityState::Completed
}

/// `POST /internal/activities/track`
pub async fn track_activity(
    State(state): State<AppState>,
    Json(body): Json<TrackActivityBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let activity_id = state.activity.track(
        &body.agent_name,
        body.activity_type,
        body.triggered_by,
        body.parent_activity_id,
        body.related_execution_id,
        body.details,
    )?;
    Ok(Json(serde_json::json!({"activity_id": activity_id})))
}

/// `POST /internal/activities/{id}/complete`
pub async fn complete_activity(
    State(state): State<AppState>,
    Path(activity_id): Path<String>,
    Json(body): Json<CompleteActivityBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let updated = state.activity.complete(
        &activity_id,
        body.status,
        body.details,
        body.error.as_deref(),
    )?;
    if !updated {
        return Err(Error::NotFound(format!("activity '{activity_id}'")).into());
    }
    Ok(Json(serde_json::json!({"status": "completed", "activity_id": activity_id})))
}
