//! MCP bearer token minting and hashing
//!
//! Tokens are opaque: `trinity_mcp_` followed by 64 hex characters of
//! cryptographic randomness (256 bits). Only the SHA-256 hash and a short
//! display prefix are ever stored.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Prefix carried by every Trinity MCP token
pub const TOKEN_PREFIX: &str = "trinity_mcp_";

/// Characters of the token kept for display purposes
pub const DISPLAY_PREFIX_LEN: usize = 16;

/// A freshly minted token with its storable parts
#[derive(Debug, Clone)]
pub struct MintedToken {
    /// The full bearer token; shown to the caller exactly once
    pub token: String,
    /// SHA-256 hex of the full token, the stored lookup key
    pub token_hash: String,
    /// Short prefix for listings, e.g. `trinity_mcp_a1b2`
    pub display_prefix: String,
}

/// Mint a new MCP token
pub fn mint() -> MintedToken {
    let mut entropy = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    let token = format!("{TOKEN_PREFIX}{}", hex::encode(entropy));
    MintedToken {
        token_hash: hash(&token),
        display_prefix: token.chars().take(DISPLAY_PREFIX_LEN).collect(),
        token,
    }
}

/// Hash a presented token for lookup
pub fn hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Quick shape check before hitting the store
pub fn looks_like_token(candidate: &str) -> bool {
    candidate.starts_with(TOKEN_PREFIX) && candidate.len() > TOKEN_PREFIX.len() + 32
}
