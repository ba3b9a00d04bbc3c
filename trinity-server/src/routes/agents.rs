//! Agent CRUD and mode toggles

use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use trinity_core::types::{AgentStatus, ReadOnlyConfig, Resources, SYSTEM_AGENT_NAME};
use trinity_core::Error;
use trinity_runtime::lifecycle::read_only;
use trinity_runtime::CreateAgentRequest;

use crate::auth::Actor;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAgentBody {
    pub name: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub credentials: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub status: AgentStatus,
    pub owner_username: Option<String>,
    pub autonomy_enabled: bool,
    pub read_only_mode: bool,
}

async fn enrich(state: &AppState, status: AgentStatus) -> AgentView {
    let record = state.store.get_agent_record(&status.name).ok().flatten();
    AgentView {
        owner_username: record.as_ref().map(|r| r.owner_username.clone()),
        autonomy_enabled: record.as_ref().is_some_and(|r| r.autonomy_enabled),
        read_only_mode: record.as_ref().is_some_and(|r| r.read_only_mode),
        status,
    }
}

/// `GET /api/agents` - the container labels are the index
pub async fn list_agents(
    State(state): State<AppState>,
    actor: Actor,
) -> ApiResult<Json<Vec<AgentView>>> {
    let mut views = Vec::new();
    for status in state.lifecycle.list_agents().await? {
        if actor.authorize_agent(&state, &status.name).is_ok() {
            views.push(enrich(&state, status).await);
        }
    }
    Ok(Json(views))
}

/// `POST /api/agents` - lifecycle creation pipeline; 409 on duplicates
pub async fn create_agent(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<CreateAgentBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.name == SYSTEM_AGENT_NAME {
        return Err(Error::Conflict(format!("'{SYSTEM_AGENT_NAME}' is reserved")).into());
    }
    let created = state
        .lifecycle
        .create_agent(
            actor.username(),
            CreateAgentRequest {
                name: body.name,
                template: body.template,
                resources: body.resources,
                credentials: body.credentials,
            },
        )
        .await?;
    state.scheduler.notify_changed();
    Ok(Json(serde_json::json!({
        "name": created.name,
        "status": created.status,
        "ssh_port": created.ssh_port,
        "template": created.template,
        "mcp_key_prefix": created.mcp_key_prefix,
        "required_credentials": created.required_credentials,
        "health_error": created.health_error,
    })))
}

/// `GET /api/agents/{name}`
pub async fn get_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<AgentView>> {
    actor.authorize_agent(&state, &name)?;
    let status = state
        .lifecycle
        .get_agent(&name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("agent '{name}'")))?;
    Ok(Json(enrich(&state, status).await))
}

/// `POST /api/agents/{name}/start` - idempotent
pub async fn start_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    state.lifecycle.start_agent(&name).await?;
    Ok(Json(serde_json::json!({"status": "started", "agent_name": name})))
}

/// `POST /api/agents/{name}/stop` - idempotent
pub async fn stop_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    state.lifecycle.stop_agent(&name).await?;
    Ok(Json(serde_json::json!({"status": "stopped", "agent_name": name})))
}

/// `DELETE /api/agents/{name}` - full cascade; 403 for the system agent
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    state.lifecycle.delete_agent(&name).await?;
    state.scheduler.notify_changed();
    Ok(Json(serde_json::json!({"status": "deleted", "agent_name": name})))
}

/// `GET /api/agents/{name}/stats` - single-shot resource usage
pub async fn agent_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let stats = state.lifecycle.stats(&name).await?;
    Ok(Json(serde_json::json!({
        "agent_name": name,
        "cpu_percent": stats.cpu_percent,
        "memory_bytes": stats.memory_bytes,
    })))
}

/// `GET /api/system/stats` - fleet-wide resource usage
pub async fn all_stats(
    State(state): State<AppState>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    let mut usage = serde_json::Map::new();
    for (name, stats) in state.lifecycle.stats_all().await? {
        if actor.authorize_agent(&state, &name).is_ok() {
            usage.insert(
                name,
                serde_json::json!({
                    "cpu_percent": stats.cpu_percent,
                    "memory_bytes": stats.memory_bytes,
                }),
            );
        }
    }
    Ok(Json(serde_json::Value::Object(usage)))
}

#[derive(Debug, Deserialize)]
pub struct AutonomyBody {
    pub enabled: bool,
}

/// `POST /api/agents/{name}/autonomy` - gate the agent's schedules
pub async fn set_autonomy(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
    Json(body): Json<AutonomyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    require_not_system(&state, &name, "autonomy")?;

    if !state.store.set_autonomy_enabled(&name, body.enabled)? {
        return Err(Error::NotFound(format!("agent '{name}'")).into());
    }
    // Autonomy flips every schedule with it
    let mut updated = 0;
    for schedule in state.store.list_agent_schedules(&name)? {
        state.store.set_schedule_enabled(&schedule.id, body.enabled)?;
        updated += 1;
    }
    state.scheduler.notify_changed();

    Ok(Json(serde_json::json!({
        "status": "updated",
        "agent_name": name,
        "autonomy_enabled": body.enabled,
        "schedules_updated": updated,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ReadOnlyBody {
    pub enabled: bool,
    #[serde(default)]
    pub config: Option<ReadOnlyPatterns>,
}

#[derive(Debug, Deserialize)]
pub struct ReadOnlyPatterns {
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default)]
    pub allowed_patterns: Vec<String>,
}

/// `GET /api/agents/{name}/read-only`
pub async fn get_read_only(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let config = state.store.get_read_only_config(&name)?;
    Ok(Json(serde_json::json!({
        "agent_name": name,
        "enabled": config.enabled,
        "config": {
            "blocked_patterns": config.block_patterns,
            "allowed_patterns": config.allow_patterns,
        },
    })))
}

/// `POST /api/agents/{name}/read-only` - toggle write protection
pub async fn set_read_only(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
    Json(body): Json<ReadOnlyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    require_not_system(&state, &name, "read-only mode")?;

    let config = match (body.enabled, body.config) {
        (true, Some(patterns)) => ReadOnlyConfig {
            enabled: true,
            block_patterns: patterns.blocked_patterns,
            allow_patterns: patterns.allowed_patterns,
        },
        (true, None) => read_only::default_config(),
        (false, _) => ReadOnlyConfig::default(),
    };
    read_only::validate_patterns(&config)?;

    if !state.store.set_read_only_config(&name, &config)? {
        return Err(Error::NotFound(format!("agent '{name}'")).into());
    }

    // Running agents get the hooks immediately; stopped ones on start
    let mut hooks_injected = false;
    if let Some(agent) = state.lifecycle.get_agent(&name).await? {
        if agent.status.is_running() {
            let result = if config.enabled {
                read_only::inject_hooks(state.lifecycle.transport(), &name, &config).await
            } else {
                read_only::remove_hooks(state.lifecycle.transport(), &name).await
            };
            hooks_injected = result.is_ok();
            if let Err(e) = result {
                tracing::warn!(agent = %name, error = %e, "hook update on running agent failed");
            }
        }
    }

    Ok(Json(serde_json::json!({
        "status": "updated",
        "agent_name": name,
        "enabled": config.enabled,
        "hooks_injected": hooks_injected,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ExportBody {
    #[serde(default)]
    pub paths: Option<Vec<String>>,
}

/// `POST /api/agents/{name}/credentials/export` - write `.credentials.enc`
pub async fn export_credentials(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
    Json(body): Json<ExportBody>,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let written = state
        .credentials
        .export_to_agent(&name, body.paths.as_deref())
        .await?;
    Ok(Json(serde_json::json!({"status": "exported", "file": written})))
}

/// `POST /api/agents/{name}/credentials/import` - restore from envelope
pub async fn import_credentials(
    State(state): State<AppState>,
    Path(name): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let files = state.credentials.import_to_agent(&name).await?;
    let mut names: Vec<&String> = files.keys().collect();
    names.sort();
    Ok(Json(serde_json::json!({"status": "imported", "files": names})))
}

/// `GET /api/agents/{name}/relay/{dashboard|metrics|git/status|...}`
pub async fn relay_get(
    State(state): State<AppState>,
    Path((name, tail)): Path<(String, String)>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let body = state
        .lifecycle
        .transport()
        .relay_get(&name, &format!("/{tail}"))
        .await
        .map_err(trinity_core::Error::from)?;
    Ok(Json(body))
}

/// `POST /api/agents/{name}/relay/{git/sync|...}` - opaque JSON relay
///
/// The request body is forwarded verbatim; endpoints like `git/sync`
/// take none, so an absent body relays as an empty object.
pub async fn relay_post(
    State(state): State<AppState>,
    Path((name, tail)): Path<(String, String)>,
    actor: Actor,
    body: Option<Json<serde_json::Value>>,
) -> ApiResult<Json<serde_json::Value>> {
    actor.authorize_agent(&state, &name)?;
    let payload = body.map(|Json(value)| value).unwrap_or_else(|| serde_json::json!({}));
    let response = state
        .lifecycle
        .transport()
        .relay_post(&name, &format!("/{tail}"), payload)
        .await
        .map_err(trinity_core::Error::from)?;
    Ok(Json(response))
}

fn require_not_system(state: &AppState, name: &str, what: &str) -> ApiResult<()> {
    if name == SYSTEM_AGENT_NAME
        || state
            .store
            .get_agent_record(name)?
            .is_some_and(|r| r.is_system)
    {
        return Err(Error::Permission(format!(
            "cannot modify {what} for the system agent"
        ))
        .into());
    }
    Ok(())
}
