//! Chat-history reporting.
//!
//! When the agent binding enables history, transcripts (and at the highest
//! level the reference audio bytes) are handed to a report sink off the
//! hot path. The sink is a narrow contract; persistence lives elsewhere.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::agent::ChatHistoryLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Asr,
    Tts,
}

#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub kind: ReportKind,
    pub text: String,
    /// Reference audio, present only at `TextAndAudio` level.
    pub audio: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn submit(&self, entry: ReportEntry);
}

/// Discards everything; the default when history is off globally.
pub struct NullReportSink;

#[async_trait]
impl ReportSink for NullReportSink {
    async fn submit(&self, _entry: ReportEntry) {}
}

/// Collects entries; used by tests.
pub struct MemoryReportSink {
    pub entries: Mutex<Vec<ReportEntry>>,
}

impl MemoryReportSink {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryReportSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn submit(&self, entry: ReportEntry) {
        self.entries.lock().unwrap().push(entry);
    }
}

/// Per-session reporter. A worker task drains the queue so slow sinks
/// never stall the audio pipeline.
pub struct ChatReporter {
    level: ChatHistoryLevel,
    tx: Option<mpsc::Sender<ReportEntry>>,
    worker: Option<JoinHandle<()>>,
}

impl ChatReporter {
    pub fn new(level: ChatHistoryLevel, sink: Arc<dyn ReportSink>) -> Self {
        if level == ChatHistoryLevel::Off {
            return Self {
                level,
                tx: None,
                worker: None,
            };
        }

        let (tx, mut rx) = mpsc::channel::<ReportEntry>(64);
        let worker = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                sink.submit(entry).await;
            }
            debug!("report worker drained");
        });

        Self {
            level,
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    pub fn level(&self) -> ChatHistoryLevel {
        self.level
    }

    pub fn report(&self, kind: ReportKind, text: &str, audio: Option<Vec<u8>>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let entry = ReportEntry {
            kind,
            text: text.to_string(),
            audio: match self.level {
                ChatHistoryLevel::TextAndAudio => audio,
                _ => None,
            },
            timestamp: Utc::now(),
        };
        // Full queue drops the entry rather than stalling the pipeline.
        let _ = tx.try_send(entry);
    }

    /// Stop accepting entries and wait for the queue to drain.
    pub async fn shutdown(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_level_drops_audio() {
        let sink = Arc::new(MemoryReportSink::new());
        let mut reporter = ChatReporter::new(ChatHistoryLevel::Text, sink.clone());
        reporter.report(ReportKind::Asr, "hello", Some(vec![1, 2, 3]));
        reporter.shutdown().await;

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "hello");
        assert!(entries[0].audio.is_none());
    }

    #[tokio::test]
    async fn audio_level_keeps_audio() {
        let sink = Arc::new(MemoryReportSink::new());
        let mut reporter = ChatReporter::new(ChatHistoryLevel::TextAndAudio, sink.clone());
        reporter.report(ReportKind::Tts, "spoken", Some(vec![9]));
        reporter.shutdown().await;

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries[0].audio.as_deref(), Some(&[9u8][..]));
    }

    #[tokio::test]
    async fn off_level_reports_nothing() {
        let sink = Arc::new(MemoryReportSink::new());
        let mut reporter = ChatReporter::new(ChatHistoryLevel::Off, sink.clone());
        reporter.report(ReportKind::Asr, "ignored", None);
        reporter.shutdown().await;
        assert!(sink.entries.lock().unwrap().is_empty());
    }
}
