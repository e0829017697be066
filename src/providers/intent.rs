//! Intent recognition adapter.

use async_trait::async_trait;

use crate::providers::ProviderError;

/// How intent recognition feeds the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    /// No recognition; every transcript goes straight to the LLM.
    None,
    /// Tool schemas are handed to the LLM, which emits function calls.
    FunctionCall,
}

#[async_trait]
pub trait IntentProvider: Send + Sync {
    fn kind(&self) -> IntentKind;

    /// Optional fast-path classification of a transcript (e.g. exit
    /// commands). `None` means continue with the normal turn.
    async fn detect(&self, transcript: &str) -> Result<Option<String>, ProviderError> {
        let _ = transcript;
        Ok(None)
    }
}
