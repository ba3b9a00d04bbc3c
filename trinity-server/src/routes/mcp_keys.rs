//! MCP key management and validation

use axum::extract::{Path, State};
use axum::http::header;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use trinity_core::types::{McpKey, McpScope};
use trinity_core::Error;

use crate::auth::Actor;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// `POST /api/mcp/keys` - mint a user-scoped key
///
/// The full token appears in this response and never again.
pub async fn create_key(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<CreateKeyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(agent) = &body.agent_name {
        actor.authorize_agent(&state, agent)?;
    }
    let (key, token) = state.store.create_mcp_key(
        actor.username(),
        body.agent_name.as_deref(),
        McpScope::User,
        body.description.as_deref(),
    )?;
    Ok(Json(serde_json::json!({
        "id": key.id,
        "token": token,
        "token_prefix": key.token_prefix,
        "agent_name": key.agent_name,
        "scope": key.scope,
        "created_at": key.created_at,
    })))
}

/// `GET /api/mcp/keys` - hashed at rest, only prefixes come back
pub async fn list_keys(
    State(state): State<AppState>,
    actor: Actor,
) -> ApiResult<Json<Vec<McpKey>>> {
    Ok(Json(state.store.list_mcp_keys(actor.username())?))
}

/// `POST /api/mcp/validate` - resolve a bearer token to its identity
///
/// Used by the MCP proxy; takes the token from the Authorization
/// header, not from the body.
pub async fn validate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| Error::Auth("missing bearer token".to_string()))?;

    let identity = state
        .store
        .validate_mcp_token(bearer)?
        .ok_or_else(|| Error::Auth("unknown or revoked MCP key".to_string()))?;

    Ok(Json(serde_json::json!({
        "valid": true,
        "username": identity.username,
        "agent_name": identity.agent_name,
        "scope": identity.scope,
    })))
}

/// `POST /api/mcp/keys/{id}/revoke`
pub async fn revoke_key(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
    actor: Actor,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.revoke_mcp_key(&key_id, actor.username())? {
        return Err(Error::NotFound(format!("key '{key_id}'")).into());
    }
    Ok(Json(serde_json::json!({"status": "revoked", "id": key_id})))
}
