//! Credential service
//!
//! Moves credential files between agent workspaces and their encrypted
//! at-rest form (`.credentials.enc`), using the agent transport for file
//! access and the envelope cipher for the crypto.

use std::sync::Arc;

use trinity_core::envelope::CredentialCipher;
use trinity_core::types::CredentialFiles;
use trinity_core::{Error, Result};

use crate::transport::AgentTransport;

/// File name of the encrypted envelope in an agent workspace
pub const ENVELOPE_FILE: &str = ".credentials.enc";

/// Files exported when the caller names none
pub const DEFAULT_CREDENTIAL_FILES: &[&str] = &[".env", ".mcp.json"];

/// Export/import of encrypted credential envelopes
pub struct CredentialService {
    cipher: CredentialCipher,
    transport: Arc<dyn AgentTransport>,
}

impl CredentialService {
    pub fn new(cipher: CredentialCipher, transport: Arc<dyn AgentTransport>) -> Self {
        Self { cipher, transport }
    }

    /// Read credential files from the agent, encrypt them, and write the
    /// envelope back into its workspace. Returns the envelope file name.
    pub async fn export_to_agent(&self, agent: &str, paths: Option<&[String]>) -> Result<String> {
        let default_paths: Vec<String> = DEFAULT_CREDENTIAL_FILES
            .iter()
            .map(|p| p.to_string())
            .collect();
        let paths = paths.unwrap_or(&default_paths);

        let files = self.transport.read_files(agent, paths).await?;
        if files.is_empty() {
            return Err(Error::Validation(
                "no credential files found to export".to_string(),
            ));
        }

        let envelope = self.cipher.encrypt(&files)?;
        let mut payload = CredentialFiles::new();
        payload.insert(ENVELOPE_FILE.to_string(), envelope);
        self.transport.inject_files(agent, &payload).await?;

        tracing::info!(agent = %agent, files = files.len(), "exported credentials to envelope");
        Ok(ENVELOPE_FILE.to_string())
    }

    /// Read the envelope from the agent, decrypt it, and write the
    /// credential files back into the workspace. Returns the files.
    pub async fn import_to_agent(&self, agent: &str) -> Result<CredentialFiles> {
        let envelope_paths = vec![ENVELOPE_FILE.to_string()];
        let files = self.transport.read_files(agent, &envelope_paths).await?;
        let envelope = files.get(ENVELOPE_FILE).ok_or_else(|| {
            Error::NotFound(format!("no {ENVELOPE_FILE} file in agent workspace"))
        })?;

        let credential_files = self.cipher.decrypt(envelope)?;
        if credential_files.is_empty() {
            return Err(Error::Validation(
                "envelope contains no credential files".to_string(),
            ));
        }

        self.transport.inject_files(agent, &credential_files).await?;
        tracing::info!(agent = %agent, files = credential_files.len(), "imported credentials from envelope");
        Ok(credential_files)
    }
}
