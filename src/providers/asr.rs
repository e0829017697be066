//! Speech-to-text adapter.

use async_trait::async_trait;

use crate::providers::ProviderError;

/// Streaming recognizer fed one audio frame at a time.
///
/// `accept_frame` is synchronous buffering so the ingress stage never holds
/// a lock across an await; network drivers flush from `finalize`.
#[async_trait]
pub trait AsrProvider: Send {
    /// Buffer one Opus (or negotiated-format) frame of utterance audio.
    fn accept_frame(&mut self, frame: &[u8]);

    /// Number of frames currently buffered.
    fn buffered_frames(&self) -> usize;

    /// Flush the utterance and return the final transcript. The adapter is
    /// ready for a new utterance afterwards.
    async fn finalize(&mut self) -> Result<String, ProviderError>;

    /// Drop any buffered audio without transcribing.
    fn reset(&mut self);
}
