//! Conversation memory adapter.

use async_trait::async_trait;

use crate::dialogue::Message;
use crate::providers::ProviderError;

#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Retrieve context relevant to the query, rendered for prompt
    /// injection. `None` means no relevant memory.
    async fn query_memory(&self, query: &str) -> Result<Option<String>, ProviderError>;

    /// Persist the finished dialogue. Called from a detached task on
    /// session close; implementations own their own batching.
    async fn save_memory(&self, dialogue: &[Message]) -> Result<(), ProviderError>;
}
