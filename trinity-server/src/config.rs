//! Environment-driven server configuration
//!
//! Everything the binary needs is read once at boot. Secrets fall back
//! to per-process random values with a loud warning where the spec of
//! the deployment allows it, and refuse to start where it does not.

use std::net::SocketAddr;
use std::path::PathBuf;

use trinity_core::envelope::CredentialCipher;
use trinity_core::{Error, Result};

/// What to do when `CREDENTIAL_ENCRYPTION_KEY` is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKeyPolicy {
    /// Generate a random key; envelopes outlive this process unreadably
    Generate,
    /// Refuse to start
    Require,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub redis_url: String,
    pub templates_dir: PathBuf,
    pub agent_image: String,
    pub agent_network: Option<String>,
    pub mcp_url: String,
    pub jwt_secret: Vec<u8>,
    pub credential_key_hex: String,
    pub otel_env: Vec<(String, String)>,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let bind = env_or("TRINITY_BIND", "0.0.0.0:8000")
            .parse()
            .map_err(|e| Error::Validation(format!("TRINITY_BIND: {e}")))?;

        let jwt_secret = match std::env::var("SECRET_KEY") {
            Ok(secret) if !secret.is_empty() => secret.into_bytes(),
            _ => {
                tracing::warn!(
                    "SECRET_KEY not set; using a random per-process key, tokens will not survive restarts"
                );
                use rand::RngCore;
                let mut key = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut key);
                key.to_vec()
            }
        };

        let policy = match env_or("CREDENTIAL_KEY_POLICY", "generate").as_str() {
            "generate" => CredentialKeyPolicy::Generate,
            "require" => CredentialKeyPolicy::Require,
            other => {
                return Err(Error::Validation(format!(
                    "CREDENTIAL_KEY_POLICY must be 'generate' or 'require', got '{other}'"
                )))
            }
        };
        let credential_key_hex = match std::env::var("CREDENTIAL_ENCRYPTION_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => match policy {
                CredentialKeyPolicy::Require => {
                    return Err(Error::Validation(
                        "CREDENTIAL_ENCRYPTION_KEY is required (policy=require); \
                         generate one with: openssl rand -hex 32"
                            .to_string(),
                    ))
                }
                CredentialKeyPolicy::Generate => {
                    tracing::warn!(
                        "CREDENTIAL_ENCRYPTION_KEY not set; generated a random key, \
                         envelopes written now are only readable by this process"
                    );
                    CredentialCipher::generate_key_hex()
                }
            },
        };
        // Fail early on malformed keys
        CredentialCipher::from_hex(&credential_key_hex)?;

        // Telemetry passthrough into agent containers
        let mut otel_env: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| k.starts_with("OTEL_"))
            .collect();
        if !otel_env.is_empty() {
            otel_env.push(("CLAUDE_CODE_ENABLE_TELEMETRY".to_string(), "1".to_string()));
        }
        otel_env.sort();

        let mut redis_url = env_or("REDIS_URL", "redis://127.0.0.1:6379");
        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            if !password.is_empty() && !redis_url.contains('@') {
                if let Some(rest) = redis_url.strip_prefix("redis://") {
                    redis_url = format!("redis://:{password}@{rest}");
                }
            }
        }

        Ok(Self {
            bind,
            db_path: env_or("TRINITY_DB_PATH", "trinity.db").into(),
            redis_url,
            templates_dir: env_or("TRINITY_TEMPLATES_DIR", "./config/agent-templates").into(),
            agent_image: env_or("AGENT_IMAGE", "trinity-agent-base:latest"),
            agent_network: match env_or("AGENT_NETWORK", "trinity-agent-network") {
                network if network.is_empty() => None,
                network => Some(network),
            },
            mcp_url: env_or("TRINITY_MCP_URL", "http://mcp-server:8080/mcp"),
            jwt_secret,
            credential_key_hex,
            otel_env,
        })
    }
}
