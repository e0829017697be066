//! Text-to-speech adapter.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::providers::ProviderError;

/// Stream of encoded Opus frames for one synthesized sentence.
pub type TtsStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ProviderError>> + Send>>;

#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize one sentence into an Opus frame stream.
    async fn synthesize(&self, text: &str) -> Result<TtsStream, ProviderError>;
}
