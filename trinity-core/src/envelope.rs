//! Credential envelope: authenticated encryption of credential files
//!
//! An envelope is the at-rest form of an agent's credential files
//! (`.credentials.enc` in its workspace):
//!
//! ```json
//! {
//!   "version": 1,
//!   "algorithm": "AES-256-GCM",
//!   "nonce": "<base64, 12 bytes>",
//!   "ciphertext": "<base64 AEAD output>"
//! }
//! ```
//!
//! The plaintext is a JSON map of relative paths to file bodies. The
//! 32-byte key comes from `CREDENTIAL_ENCRYPTION_KEY` as hex.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::CredentialFiles;

const ENVELOPE_VERSION: u32 = 1;
const ENVELOPE_ALGORITHM: &str = "AES-256-GCM";

/// Errors from envelope encryption and decryption
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Key is not 32 bytes of hex
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    /// Envelope JSON missing fields, wrong version or algorithm
    #[error("unsupported envelope format: {0}")]
    UnsupportedFormat(String),

    /// AEAD tag verification failed
    #[error("decryption failed: wrong key or tampered data")]
    WrongKeyOrTampered,

    /// Plaintext did not decode as a path→content map
    #[error("decrypted payload is not a credential file map: {0}")]
    BadPlaintext(String),
}

impl From<EnvelopeError> for crate::error::Error {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::InvalidKey(msg) => Self::Internal(format!("credential key: {msg}")),
            other => Self::Validation(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeJson {
    version: u32,
    algorithm: String,
    nonce: String,
    ciphertext: String,
}

/// AES-256-GCM cipher over credential file maps
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Build from a 32-byte key
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
        Self { cipher }
    }

    /// Build from a 64-character hex string
    pub fn from_hex(key_hex: &str) -> Result<Self, EnvelopeError> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| EnvelopeError::InvalidKey(format!("must be hex: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            EnvelopeError::InvalidKey(format!("must be 32 bytes (64 hex chars), got {}", v.len()))
        })?;
        Ok(Self::new(&key))
    }

    /// Generate a fresh random key, returned as hex for operator storage
    pub fn generate_key_hex() -> String {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }

    /// Encrypt a credential file map to envelope JSON
    pub fn encrypt(&self, files: &CredentialFiles) -> Result<String, EnvelopeError> {
        // BTreeMap for a canonical plaintext ordering
        let ordered: BTreeMap<&String, &String> = files.iter().collect();
        let plaintext = serde_json::to_vec(&ordered)
            .map_err(|e| EnvelopeError::BadPlaintext(e.to_string()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| EnvelopeError::WrongKeyOrTampered)?;

        let envelope = EnvelopeJson {
            version: ENVELOPE_VERSION,
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        };
        serde_json::to_string_pretty(&envelope)
            .map_err(|e| EnvelopeError::BadPlaintext(e.to_string()))
    }

    /// Decrypt envelope JSON back into a credential file map
    pub fn decrypt(&self, envelope_json: &str) -> Result<CredentialFiles, EnvelopeError> {
        let envelope: EnvelopeJson = serde_json::from_str(envelope_json)
            .map_err(|e| EnvelopeError::UnsupportedFormat(format!("invalid JSON: {e}")))?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedFormat(format!(
                "unsupported version {}",
                envelope.version
            )));
        }
        if envelope.algorithm != ENVELOPE_ALGORITHM {
            return Err(EnvelopeError::UnsupportedFormat(format!(
                "unsupported algorithm '{}'",
                envelope.algorithm
            )));
        }

        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| EnvelopeError::UnsupportedFormat(format!("bad nonce: {e}")))?;
        if nonce_bytes.len() != 12 {
            return Err(EnvelopeError::UnsupportedFormat(format!(
                "nonce must be 12 bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| EnvelopeError::UnsupportedFormat(format!("bad ciphertext: {e}")))?;

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| EnvelopeError::WrongKeyOrTampered)?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| EnvelopeError::BadPlaintext(e.to_string()))
    }
}
