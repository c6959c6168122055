//! Passphrase prompting and per-volume caching.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

/// Errors obtaining a passphrase
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PassphraseError {
    /// The user dismissed the prompt
    #[error("passphrase prompt cancelled")]
    Cancelled,
    /// The prompt itself failed
    #[error("passphrase prompt failed: {0}")]
    Prompt(String),
}

/// What the user entered at a passphrase prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassphraseResponse {
    /// The passphrase
    pub passphrase: String,
    /// Whether to keep it for later requests and restores
    pub remember: bool,
}

/// Asks the user for an archive passphrase.
#[async_trait]
pub trait PassphraseProvider: Send + Sync {
    /// Prompt for the passphrase of `file_system_id`.
    async fn prompt(&self, file_system_id: &str) -> Result<PassphraseResponse, PassphraseError>;
}

/// Provider for hosts with no way to prompt. Always cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPassphrase;

#[async_trait]
impl PassphraseProvider for NoPassphrase {
    async fn prompt(&self, _file_system_id: &str) -> Result<PassphraseResponse, PassphraseError> {
        Err(PassphraseError::Cancelled)
    }
}

/// Answers passphrase requests for one volume, remembering when asked to.
pub struct PassphraseManager {
    provider: Arc<dyn PassphraseProvider>,
    cached: Mutex<Option<String>>,
}

impl std::fmt::Debug for PassphraseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseManager")
            .field("cached", &self.cached().is_some())
            .finish_non_exhaustive()
    }
}

impl PassphraseManager {
    /// Create a manager, optionally seeded with a remembered passphrase.
    pub fn new(provider: Arc<dyn PassphraseProvider>, cached: Option<String>) -> Self {
        Self {
            provider,
            cached: Mutex::new(cached),
        }
    }

    /// The remembered passphrase, if any.
    pub fn cached(&self) -> Option<String> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get a passphrase, prompting only when none is remembered.
    ///
    /// Returns the passphrase and whether it was newly remembered.
    pub async fn get_passphrase(
        &self,
        file_system_id: &str,
    ) -> Result<(String, bool), PassphraseError> {
        if let Some(passphrase) = self.cached() {
            return Ok((passphrase, false));
        }

        let response = self.provider.prompt(file_system_id).await?;
        if response.remember {
            *self.cached.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(response.passphrase.clone());
        }
        Ok((response.passphrase, response.remember))
    }
}
