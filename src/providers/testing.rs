//! Deterministic provider implementations.
//!
//! These double as the fallback adapters when an agent binding selects no
//! concrete driver, and as the workhorses of the test suite: scripted
//! transcripts, scripted LLM streams, silence TTS, and no-op memory /
//! intent / voiceprint.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::dialogue::Message;
use crate::providers::llm::{LlmChunk, LlmProvider, LlmStream, ToolCallDelta};
use crate::providers::tts::{TtsProvider, TtsStream};
use crate::providers::{
    AsrProvider, IntentKind, IntentProvider, MemoryProvider, ProviderError, VadProvider,
    VoiceprintProvider,
};

/// Returns pre-scripted transcripts in order; empty string when exhausted.
pub struct ScriptedAsr {
    transcripts: Mutex<VecDeque<String>>,
    buffered: Vec<Vec<u8>>,
}

impl ScriptedAsr {
    pub fn new(transcripts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            transcripts: Mutex::new(transcripts.into_iter().map(Into::into).collect()),
            buffered: Vec::new(),
        }
    }
}

#[async_trait]
impl AsrProvider for ScriptedAsr {
    fn accept_frame(&mut self, frame: &[u8]) {
        self.buffered.push(frame.to_vec());
    }

    fn buffered_frames(&self) -> usize {
        self.buffered.len()
    }

    async fn finalize(&mut self) -> Result<String, ProviderError> {
        self.buffered.clear();
        Ok(self
            .transcripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    fn reset(&mut self) {
        self.buffered.clear();
    }
}

/// Yields scripted chunk sequences, one per `stream_chat` call.
pub struct ScriptedLlm {
    turns: Mutex<VecDeque<Vec<LlmChunk>>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Vec<LlmChunk>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }

    /// One turn of plain text, split per word to exercise chunking.
    pub fn text_turn(text: &str) -> Vec<LlmChunk> {
        text.split_inclusive(' ')
            .map(|word| LlmChunk {
                content: Some(word.to_string()),
                tool_calls: vec![],
            })
            .collect()
    }

    /// One turn holding a single structured tool call.
    pub fn tool_call_turn(id: &str, name: &str, arguments: &str) -> Vec<LlmChunk> {
        vec![LlmChunk {
            content: None,
            tool_calls: vec![ToolCallDelta {
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(arguments.to_string()),
            }],
        }]
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn stream_chat(
        &self,
        _messages: Vec<Value>,
        _tools: Option<Vec<Value>>,
    ) -> Result<LlmStream, ProviderError> {
        let chunks = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(
            chunks.into_iter().map(Ok),
        )))
    }
}

/// Emits one empty Opus frame per word; enough structure for pacing and
/// ordering assertions without a codec.
pub struct SilenceTts;

#[async_trait]
impl TtsProvider for SilenceTts {
    async fn synthesize(&self, text: &str) -> Result<TtsStream, ProviderError> {
        let frames: Vec<Result<Vec<u8>, ProviderError>> = text
            .split_whitespace()
            .map(|_| Ok(vec![0u8; 8]))
            .collect();
        Ok(Box::pin(futures::stream::iter(frames)))
    }
}

/// TTS that fails a fixed number of times before succeeding. Exercises the
/// retry budget.
pub struct FlakyTts {
    failures_left: Mutex<u32>,
}

impl FlakyTts {
    pub fn new(failures: u32) -> Self {
        Self {
            failures_left: Mutex::new(failures),
        }
    }
}

#[async_trait]
impl TtsProvider for FlakyTts {
    async fn synthesize(&self, text: &str) -> Result<TtsStream, ProviderError> {
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ProviderError::Transport("synthetic failure".to_string()));
            }
        }
        SilenceTts.synthesize(text).await
    }
}

/// Marks every frame voiced or unvoiced according to a scripted pattern,
/// then repeats the final value.
pub struct PatternVad {
    pattern: Vec<bool>,
    index: usize,
}

impl PatternVad {
    pub fn new(pattern: Vec<bool>) -> Self {
        Self { pattern, index: 0 }
    }
}

impl VadProvider for PatternVad {
    fn is_voice(&mut self, _frame: &[u8]) -> Result<bool, ProviderError> {
        let value = self
            .pattern
            .get(self.index)
            .or(self.pattern.last())
            .copied()
            .unwrap_or(false);
        self.index += 1;
        Ok(value)
    }

    fn reset(&mut self) {
        self.index = 0;
    }
}

pub struct NoopMemory;

#[async_trait]
impl MemoryProvider for NoopMemory {
    async fn query_memory(&self, _query: &str) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }

    async fn save_memory(&self, _dialogue: &[Message]) -> Result<(), ProviderError> {
        Ok(())
    }
}

pub struct FunctionCallIntent;

#[async_trait]
impl IntentProvider for FunctionCallIntent {
    fn kind(&self) -> IntentKind {
        IntentKind::FunctionCall
    }
}

pub struct NoIntent;

#[async_trait]
impl IntentProvider for NoIntent {
    fn kind(&self) -> IntentKind {
        IntentKind::None
    }
}

pub struct NoopVoiceprint;

#[async_trait]
impl VoiceprintProvider for NoopVoiceprint {
    async fn identify(&self, _audio: &[u8]) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn scripted_asr_returns_in_order() {
        let mut asr = ScriptedAsr::new(["hello", "goodbye"]);
        asr.accept_frame(&[1, 2, 3]);
        assert_eq!(asr.buffered_frames(), 1);
        assert_eq!(asr.finalize().await.unwrap(), "hello");
        assert_eq!(asr.buffered_frames(), 0);
        assert_eq!(asr.finalize().await.unwrap(), "goodbye");
        assert_eq!(asr.finalize().await.unwrap(), "");
    }

    #[tokio::test]
    async fn silence_tts_emits_one_frame_per_word() {
        let mut stream = SilenceTts.synthesize("Hi there friend").await.unwrap();
        let mut count = 0;
        while let Some(frame) = stream.next().await {
            frame.unwrap();
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn flaky_tts_recovers() {
        let tts = FlakyTts::new(2);
        assert!(tts.synthesize("x").await.is_err());
        assert!(tts.synthesize("x").await.is_err());
        assert!(tts.synthesize("x").await.is_ok());
    }

    #[test]
    fn pattern_vad_repeats_tail() {
        let mut vad = PatternVad::new(vec![false, true]);
        assert!(!vad.is_voice(&[]).unwrap());
        assert!(vad.is_voice(&[]).unwrap());
        assert!(vad.is_voice(&[]).unwrap());
    }
}
