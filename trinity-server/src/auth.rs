//! Actor resolution: JWTs for humans, MCP keys for agents
//!
//! Every request resolves to an [`Actor`]. A bearer token shaped like a
//! Trinity MCP key is validated against the store; anything else is
//! treated as a JWT. Token-scoped access: user-scoped keys act only on
//! agents their owner may touch, system-scoped keys bypass permission
//! checks but are still audited.

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use trinity_core::types::{McpIdentity, McpScope};
use trinity_core::{token, Error, Result};

use crate::error::ApiError;
use crate::state::AppState;

/// Token lifetime for issued JWTs
const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// Signing/verification keys derived from `SECRET_KEY`
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Issue a token for a verified user
    pub fn issue(&self, username: &str) -> Result<String> {
        let claims = Claims {
            sub: username.to_string(),
            exp: (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token encode: {e}")))
    }

    /// Verify a token, returning the username
    pub fn verify(&self, token: &str) -> Result<String> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims.sub)
            .map_err(|e| Error::Auth(format!("invalid token: {e}")))
    }
}

/// Who is making this request
#[derive(Debug, Clone)]
pub enum Actor {
    /// A human, authenticated by JWT
    User { username: String },
    /// An agent or integration, authenticated by MCP key
    Mcp(McpIdentity),
}

impl Actor {
    /// Account the action is attributed to
    pub fn username(&self) -> &str {
        match self {
            Self::User { username } => username,
            Self::Mcp(identity) => &identity.username,
        }
    }

    /// The agent acting, for agent-scoped MCP keys
    pub fn acting_agent(&self) -> Option<&str> {
        match self {
            Self::User { .. } => None,
            Self::Mcp(identity) => identity.agent_name.as_deref(),
        }
    }

    /// System-scoped keys bypass permission checks (still audited)
    pub fn is_system_scoped(&self) -> bool {
        matches!(
            self,
            Self::Mcp(McpIdentity {
                scope: McpScope::System,
                ..
            })
        )
    }

    /// May this actor act on the given agent at all?
    pub fn authorize_agent(&self, state: &AppState, agent: &str) -> Result<()> {
        if self.is_system_scoped() {
            return Ok(());
        }
        match state.store.get_agent_owner(agent)? {
            None => Err(Error::NotFound(format!("agent '{agent}'"))),
            Some(owner) if owner == self.username() => Ok(()),
            Some(_) => {
                // An agent-scoped key may also reach agents its own
                // agent has a dispatch edge to
                if let Some(source) = self.acting_agent() {
                    if state.resolver.can_dispatch(source, agent)? {
                        return Ok(());
                    }
                }
                Err(Error::Permission(format!(
                    "no access to agent '{agent}'"
                )))
            }
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError(Error::Auth("missing bearer token".to_string())))?;

        if token::looks_like_token(bearer) {
            let identity = state
                .store
                .validate_mcp_token(bearer)
                .map_err(|e| ApiError(e.into()))?
                .ok_or_else(|| ApiError(Error::Auth("unknown or revoked MCP key".to_string())))?;
            return Ok(Actor::Mcp(identity));
        }

        let username = state.jwt.verify(bearer).map_err(ApiError)?;
        Ok(Actor::User { username })
    }
}
