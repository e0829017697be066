//! TTS output stages: sentence synthesis and paced frame egress.
//!
//! Two workers bridge the chat driver to the device. The text worker
//! consumes `TtsJob`s, synthesizes Opus frames (with a retry budget and a
//! spoken apology on persistent failure), and forwards structured events
//! to the egress worker, which paces frames by the negotiated duration and
//! emits the `tts` control envelopes. `client_abort` is checked between
//! jobs, between frames, and before every control message; an abort clears
//! the queues and suppresses the trailing `tts stop`.

use std::sync::Arc;

use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, warn};

use crate::protocol::{ServerEnvelope, TtsState};
use crate::session::report::ReportKind;
use crate::session::Session;
use crate::types::Outbound;

/// Synthesis attempts per sentence.
pub const TTS_SYNTH_RETRIES: u32 = 5;
const APOLOGY_TEXT: &str = "Sorry, I'm having trouble speaking right now.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceOrdinal {
    First,
    Middle,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    File,
    Action,
}

/// One unit of TTS work; all jobs of a turn share a sentence id.
#[derive(Debug, Clone)]
pub struct TtsJob {
    pub sentence_id: String,
    pub ordinal: SentenceOrdinal,
    pub kind: ContentKind,
    pub text: Option<String>,
    /// Length-prefixed Opus frame stream for `ContentKind::File`.
    pub file: Option<Vec<u8>>,
}

impl TtsJob {
    pub fn action(sentence_id: &str, ordinal: SentenceOrdinal) -> Self {
        Self {
            sentence_id: sentence_id.to_string(),
            ordinal,
            kind: ContentKind::Action,
            text: None,
            file: None,
        }
    }

    pub fn sentence(sentence_id: &str, text: impl Into<String>) -> Self {
        Self {
            sentence_id: sentence_id.to_string(),
            ordinal: SentenceOrdinal::Middle,
            kind: ContentKind::Text,
            text: Some(text.into()),
            file: None,
        }
    }
}

/// Events flowing from the text worker to the egress worker.
#[derive(Debug, Clone)]
pub enum AudioOut {
    Start { sentence_id: String },
    SentenceStart { sentence_id: String, text: String },
    Frame(Vec<u8>),
    SentenceEnd { sentence_id: String },
    Stop { sentence_id: String },
}

/// Strip markdown the model may emit; the result is spoken aloud.
pub fn clean_markdown(text: &str) -> String {
    static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
    static EMPHASIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*_`#]+").unwrap());
    let text = LINK.replace_all(text, "$1");
    EMPHASIS.replace_all(&text, "").trim().to_string()
}

/// Synthesize one sentence into the egress queue. Returns false when the
/// egress channel is gone.
async fn synthesize_sentence(
    session: &Arc<Session>,
    text: &str,
    audio_out: &mpsc::Sender<AudioOut>,
) -> bool {
    let Some(adapters) = session.adapters_snapshot().await else {
        warn!("tts job with no adapters installed");
        return true;
    };

    let mut attempts = 0;
    let mut stream = loop {
        match adapters.tts.synthesize(text).await {
            Ok(stream) => break Some(stream),
            Err(e) => {
                attempts += 1;
                warn!(attempt = attempts, error = %e, "tts synthesis failed");
                if attempts >= TTS_SYNTH_RETRIES || !e.is_retryable() {
                    break None;
                }
            }
        }
    };

    // Degrade gracefully: one apology attempt through the same adapter.
    let mut spoken_text = text.to_string();
    if stream.is_none() && text != APOLOGY_TEXT {
        error!("tts retries exhausted, speaking apology");
        if let Ok(apology) = adapters.tts.synthesize(APOLOGY_TEXT).await {
            stream = Some(apology);
            spoken_text = APOLOGY_TEXT.to_string();
        }
    }
    let Some(mut stream) = stream else {
        error!("tts unavailable, dropping sentence");
        return true;
    };

    let mut frames: Vec<Vec<u8>> = Vec::new();
    while let Some(frame) = stream.next().await {
        if session.is_aborted() {
            return true;
        }
        match frame {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                warn!(error = %e, "tts stream error mid-sentence");
                break;
            }
        }
    }

    session.reporter_report(
        ReportKind::Tts,
        &spoken_text,
        Some(frames.concat()),
    );

    for frame in frames {
        if session.is_aborted() {
            return true;
        }
        if audio_out.send(AudioOut::Frame(frame)).await.is_err() {
            return false;
        }
    }
    true
}

/// Text worker: TtsJob stream in, AudioOut stream out.
pub async fn text_worker(
    session: Arc<Session>,
    mut jobs: mpsc::Receiver<TtsJob>,
    audio_out: mpsc::Sender<AudioOut>,
) {
    while let Some(job) = jobs.recv().await {
        if session.is_stopping() {
            break;
        }
        if session.is_aborted() && job.ordinal != SentenceOrdinal::First {
            debug!("abort set, skipping tts job");
            continue;
        }

        match job.ordinal {
            SentenceOrdinal::First => {
                if audio_out
                    .send(AudioOut::Start {
                        sentence_id: job.sentence_id.clone(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            SentenceOrdinal::Middle => match job.kind {
                ContentKind::Text => {
                    let Some(text) = job.text.as_deref() else {
                        continue;
                    };
                    let cleaned = clean_markdown(text);
                    if cleaned.is_empty() {
                        continue;
                    }
                    if audio_out
                        .send(AudioOut::SentenceStart {
                            sentence_id: job.sentence_id.clone(),
                            text: cleaned.clone(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    if !synthesize_sentence(&session, &cleaned, &audio_out).await {
                        break;
                    }
                    if audio_out
                        .send(AudioOut::SentenceEnd {
                            sentence_id: job.sentence_id.clone(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                ContentKind::File => {
                    let Some(bytes) = job.file.as_deref() else {
                        continue;
                    };
                    let frame_duration = session.frame_duration_ms();
                    match crate::audio::framefile::decode_frames(bytes, frame_duration) {
                        Ok((frames, _)) => {
                            for frame in frames {
                                if session.is_aborted() {
                                    break;
                                }
                                if audio_out.send(AudioOut::Frame(frame)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "bad audio file payload"),
                    }
                }
                ContentKind::Action => {}
            },
            SentenceOrdinal::Last => {
                if audio_out
                    .send(AudioOut::Stop {
                        sentence_id: job.sentence_id.clone(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    debug!("tts text worker exiting");
}

/// Egress worker: sends control envelopes and paces audio frames by the
/// negotiated frame duration.
pub async fn egress_worker(session: Arc<Session>, mut events: mpsc::Receiver<AudioOut>) {
    let mut deadline = Instant::now();

    while let Some(event) = events.recv().await {
        if session.is_stopping() {
            break;
        }
        if session.is_aborted() {
            // Drop everything queued; the turn is over. No tts stop is
            // sent: the abort pre-empts it.
            while events.try_recv().is_ok() {}
            session.set_speaking(false);
            continue;
        }

        match event {
            AudioOut::Start { sentence_id } => {
                session.set_speaking(true);
                deadline = Instant::now();
                session
                    .send_envelope(ServerEnvelope::Tts {
                        state: TtsState::Start,
                        text: None,
                        session_id: session.session_id.clone(),
                        sentence_id,
                    })
                    .await;
            }
            AudioOut::SentenceStart { sentence_id, text } => {
                session
                    .send_envelope(ServerEnvelope::Tts {
                        state: TtsState::SentenceStart,
                        text: Some(text),
                        session_id: session.session_id.clone(),
                        sentence_id,
                    })
                    .await;
            }
            AudioOut::Frame(frame) => {
                let now = Instant::now();
                if deadline < now {
                    deadline = now;
                }
                sleep_until(deadline).await;
                if session.is_aborted() {
                    continue;
                }
                if session.outbound.send(Outbound::Audio(frame)).await.is_err() {
                    break;
                }
                deadline += Duration::from_millis(session.frame_duration_ms() as u64);
            }
            AudioOut::SentenceEnd { sentence_id } => {
                session
                    .send_envelope(ServerEnvelope::Tts {
                        state: TtsState::SentenceEnd,
                        text: None,
                        session_id: session.session_id.clone(),
                        sentence_id,
                    })
                    .await;
            }
            AudioOut::Stop { sentence_id } => {
                session
                    .send_envelope(ServerEnvelope::Tts {
                        state: TtsState::Stop,
                        text: None,
                        session_id: session.session_id.clone(),
                        sentence_id,
                    })
                    .await;
                session.set_speaking(false);
            }
        }
    }
    debug!("tts egress worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_is_stripped() {
        assert_eq!(clean_markdown("**bold** and _soft_"), "bold and soft");
        assert_eq!(clean_markdown("see [the docs](http://x) now"), "see the docs now");
        assert_eq!(clean_markdown("# Heading"), "Heading");
        assert_eq!(clean_markdown("plain text."), "plain text.");
    }
}
