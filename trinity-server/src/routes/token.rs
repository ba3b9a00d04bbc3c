//! JWT issuance
//!
//! bcrypt verification only; there is no plaintext fallback. Databases
//! predating that rule run `trinityd --migrate-passwords` once.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use trinity_core::Error;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenBody {
    pub username: String,
    pub password: String,
}

/// `POST /api/token`
pub async fn issue_token(
    State(state): State<AppState>,
    Json(body): Json<TokenBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.verify_password(&body.username, &body.password)? {
        return Err(Error::Auth("invalid username or password".to_string()).into());
    }
    let token = state.jwt.issue(&body.username)?;
    Ok(Json(serde_json::json!({
        "access_token": token,
        "token_type": "bearer",
    })))
}
