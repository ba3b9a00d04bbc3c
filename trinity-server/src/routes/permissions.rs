//! Inter-agent permission surface

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::auth::Actor;
use crate::error::ApiResult;
use crate::state::AppState;

/// `GET /api/agents/{name}/permissions`
pub async fn get_permissions(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    Ok(Json(serde_json::json!({
        "agent_name": name,
        "available_agents": state.resolver.list_reachable(&name)?,
        "inbound_agents": state.resolver.list_inbound(&name)?,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PermissionSetBody {
    pub targets: Vec<String>,
}

/// `PUT /api/agents/{name}/permissions` - replace the outbound edge set
pub async fn set_permissions(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
    Json(body): Json<PermissionSetBody>,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;

    // Validate everything before mutating anything
    for target in &body.targets {
        if state.store.get_agent_record(target)?.is_none() {
            return Err(trinity_core::Error::NotFound(format!("agent '{target}'")).into());
        }
        if target == &name {
            return Err(trinity_core::Error::Validation(
                "self-grants are rejected".to_string(),
            )
            .into());
        }
    }

    let existing = state.store.list_reachable_agents(&name)?;
    for target in &existing {
        if !body.targets.contains(target) {
            state.resolver.revoke(&name, target)?;
        }
    }
    for target in &body.targets {
        if !existing.contains(target) {
            state.resolver.grant(&name, target)?;
        }
    }

    Ok(Json(serde_json::json!({
        "status": "updated",
        "agent_name": name,
        "available_agents": state.resolver.list_reachable(&name)?,
    })))
}

/// `POST /api/agents/{name}/permissions/{target}` - single grant
pub async fn grant_permission(
    State(state): State<AppState>,
    Path((name, target)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let inserted = state.resolver.grant(&name, &target)?;
    Ok(Json(serde_json::json!({
        "status": if inserted { "granted" } else { "unchanged" },
        "source_agent": name,
        "target_agent": target,
    })))
}

/// `DELETE /api/agents/{name}/permissions/{target}` - single revoke
pub async fn revoke_permission(
    State(state): State<AppState>,
    Path((name, target)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let removed = state.resolver.revoke(&name, &target)?;
    Ok(Json(serde_json::json!({
        "status": if removed { "revoked" } else { "unchanged" },
        "source_agent": name,
        "target_agent": target,
    })))
}
