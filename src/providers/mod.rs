//! Provider adapter interfaces.
//!
//! Each external capability (VAD, ASR, LLM, TTS, memory, intent,
//! voiceprint) sits behind a small trait. Concrete drivers live out of
//! tree; the bundled implementations cover the built-in defaults
//! (energy VAD, OpenAI-compatible LLM transport) and deterministic stand-ins
//! used by the test suite.

pub mod asr;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod testing;
pub mod tts;
pub mod vad;
pub mod voiceprint;

use thiserror::Error;

/// Typed transport-boundary errors. Callers branch on the variant instead
/// of inspecting message strings.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_) | ProviderError::RateLimited(_) | ProviderError::Timeout(_)
        )
    }

    /// Classify an HTTP status from a provider backend.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ProviderError::Auth(body),
            429 => ProviderError::RateLimited(body),
            408 | 504 => ProviderError::Timeout(body),
            500..=599 => ProviderError::Transport(format!("{status}: {body}")),
            _ => ProviderError::Other(format!("{status}: {body}")),
        }
    }
}

pub use asr::AsrProvider;
pub use intent::{IntentKind, IntentProvider};
pub use llm::{LlmChunk, LlmEvent, LlmProvider, LlmStream, ToolCallRequest};
pub use memory::MemoryProvider;
pub use tts::{TtsProvider, TtsStream};
pub use vad::VadProvider;
pub use voiceprint::VoiceprintProvider;
