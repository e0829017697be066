//! Speaker identification adapter.

use async_trait::async_trait;

use crate::providers::ProviderError;

#[async_trait]
pub trait VoiceprintProvider: Send + Sync {
    /// Identify the speaker from utterance audio. Returns the registered
    /// speaker name, or `None` when no enrollment matches.
    async fn identify(&self, audio: &[u8]) -> Result<Option<String>, ProviderError>;
}
