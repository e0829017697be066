//! Ingress stage: device audio frames to finished transcripts.
//!
//! Frames (optionally timestamped by the V2 protocol) are reordered
//! through a small buffer, gated by a rolling VAD vote, and fed to the
//! ASR adapter. When silence outlasts the VAD hangover the utterance is
//! flushed, the transcript echoed to the device, and the chat turn runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ServerEnvelope;
use crate::session::report::ReportKind;
use crate::session::{chat, Session};

/// Entries held while waiting for late out-of-order V2 frames.
pub const TIMESTAMP_REORDER_CAPACITY: usize = 20;
/// Frames in the majority-vote window deciding `have_voice`.
pub const VAD_VOTE_WINDOW: usize = 5;

/// Message into the ingress worker.
#[derive(Debug)]
pub enum AudioIn {
    Frame {
        bytes: Vec<u8>,
        timestamp: Option<u32>,
    },
    /// Manual listen-stop: flush the utterance now.
    FlushUtterance,
}

/// Reorders timestamped frames; untimestamped frames pass through.
struct ReorderBuffer {
    buffered: BTreeMap<u32, Vec<u8>>,
    last_processed: u32,
    started: bool,
}

impl ReorderBuffer {
    fn new() -> Self {
        Self {
            buffered: BTreeMap::new(),
            last_processed: 0,
            started: false,
        }
    }

    fn accept(&mut self, bytes: Vec<u8>, timestamp: Option<u32>) -> Vec<Vec<u8>> {
        let Some(ts) = timestamp else {
            return vec![bytes];
        };

        if !self.started || ts >= self.last_processed {
            self.started = true;
            self.last_processed = ts;
            let mut out = vec![bytes];
            // Release any buffered frames that are now in order.
            loop {
                let Some((&next_ts, _)) = self.buffered.iter().next() else {
                    break;
                };
                if next_ts < self.last_processed {
                    // Stale entry, drop it.
                    self.buffered.remove(&next_ts);
                    continue;
                }
                let frame = self.buffered.remove(&next_ts).unwrap();
                self.last_processed = next_ts;
                out.push(frame);
            }
            out
        } else if self.buffered.len() < TIMESTAMP_REORDER_CAPACITY {
            self.buffered.insert(ts, bytes);
            Vec::new()
        } else {
            // Buffer full: the late frame is dropped, preserving
            // arrival-order processing.
            Vec::new()
        }
    }
}

/// Rolling majority vote over the last N VAD decisions.
struct VadVote {
    window: std::collections::VecDeque<bool>,
}

impl VadVote {
    fn new() -> Self {
        Self {
            window: std::collections::VecDeque::with_capacity(VAD_VOTE_WINDOW),
        }
    }

    fn push(&mut self, is_voice: bool) -> bool {
        if self.window.len() == VAD_VOTE_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(is_voice);
        let ayes = self.window.iter().filter(|&&v| v).count();
        ayes * 2 > self.window.len()
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}

struct UtteranceState {
    vote: VadVote,
    have_voice: bool,
    silence_frames: u32,
    /// Raw utterance audio, kept for voiceprint identification and
    /// text+audio history reporting.
    audio: Vec<u8>,
}

impl UtteranceState {
    fn new() -> Self {
        Self {
            vote: VadVote::new(),
            have_voice: false,
            silence_frames: 0,
            audio: Vec::new(),
        }
    }

    fn reset(&mut self) -> Vec<u8> {
        self.vote.reset();
        self.have_voice = false;
        self.silence_frames = 0;
        std::mem::take(&mut self.audio)
    }
}

pub async fn ingress_worker(session: Arc<Session>, mut rx: mpsc::Receiver<AudioIn>) {
    let mut reorder = ReorderBuffer::new();
    let mut utterance = UtteranceState::new();

    while let Some(message) = rx.recv().await {
        if session.is_stopping() {
            break;
        }
        match message {
            AudioIn::Frame { bytes, timestamp } => {
                for frame in reorder.accept(bytes, timestamp) {
                    process_frame(&session, &mut utterance, frame).await;
                }
            }
            AudioIn::FlushUtterance => {
                finalize_utterance(&session, &mut utterance).await;
            }
        }
    }
    debug!("audio ingress worker exiting");
}

async fn process_frame(session: &Arc<Session>, utterance: &mut UtteranceState, frame: Vec<u8>) {
    session.touch_activity();
    let Some(adapters) = session.adapters_snapshot().await else {
        return;
    };

    // Manual mode: the device brackets speech with listen start/stop, so
    // every frame while listening is utterance audio.
    if session.is_manual_listen() {
        if session.is_manual_listening() {
            utterance.audio.extend_from_slice(&frame);
            adapters.asr.lock().await.accept_frame(&frame);
        }
        return;
    }

    let (is_voice, hangover_ms) = {
        let mut vad = adapters.vad.lock().await;
        let hangover = vad.hangover_ms();
        match vad.is_voice(&frame) {
            Ok(v) => (v, hangover),
            Err(e) => {
                warn!(error = %e, "vad failure, treating frame as silence");
                (false, hangover)
            }
        }
    };
    let voting_voice = utterance.vote.push(is_voice);

    if voting_voice {
        utterance.have_voice = true;
        utterance.silence_frames = 0;
    }

    if utterance.have_voice {
        utterance.audio.extend_from_slice(&frame);
        adapters.asr.lock().await.accept_frame(&frame);

        if !voting_voice {
            utterance.silence_frames += 1;
            let frame_ms = session.frame_duration_ms().max(1);
            if utterance.silence_frames * frame_ms >= hangover_ms {
                finalize_utterance(session, utterance).await;
            }
        }
    }
}

async fn finalize_utterance(session: &Arc<Session>, utterance: &mut UtteranceState) {
    let audio = utterance.reset();
    let Some(adapters) = session.adapters_snapshot().await else {
        return;
    };

    let transcript = {
        let mut asr = adapters.asr.lock().await;
        if asr.buffered_frames() == 0 {
            return;
        }
        match asr.finalize().await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "asr finalize failed");
                return;
            }
        }
    };
    {
        let mut vad = adapters.vad.lock().await;
        vad.reset();
    }

    let transcript = transcript.trim().to_string();
    // An empty recognition result never reaches the model.
    if transcript.is_empty() {
        debug!("empty transcript, skipping turn");
        return;
    }

    // Fast-path intent classification (exit commands and the like).
    match adapters.intent.detect(&transcript).await {
        Ok(Some(intent)) if intent == "exit" => {
            debug!("exit intent recognized");
            session.request_close().await;
            return;
        }
        Ok(_) => {}
        Err(e) => debug!(error = %e, "intent detection failed, continuing"),
    }

    // Speaker identification tags the transcript when an enrollment
    // matches.
    let transcript = match adapters.voiceprint.identify(&audio).await {
        Ok(Some(speaker)) => format!("{speaker}: {transcript}"),
        Ok(None) => transcript,
        Err(e) => {
            debug!(error = %e, "voiceprint identify failed");
            transcript
        }
    };

    session
        .send_envelope(ServerEnvelope::Stt {
            text: transcript.clone(),
            session_id: session.session_id.clone(),
        })
        .await;
    session.reporter_report(ReportKind::Asr, &transcript, Some(audio));

    chat::run_turn(session.clone(), transcript, 0).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untimestamped_frames_pass_through() {
        let mut buffer = ReorderBuffer::new();
        assert_eq!(buffer.accept(vec![1], None), vec![vec![1]]);
    }

    #[test]
    fn in_order_timestamps_pass_through() {
        let mut buffer = ReorderBuffer::new();
        assert_eq!(buffer.accept(vec![1], Some(0)).len(), 1);
        assert_eq!(buffer.accept(vec![2], Some(60)).len(), 1);
    }

    #[test]
    fn late_frame_is_buffered_until_order_restores() {
        let mut buffer = ReorderBuffer::new();
        buffer.accept(vec![1], Some(120));
        // Older than last processed: held back.
        assert!(buffer.accept(vec![0], Some(60)).is_empty());
        // Next in-order frame releases nothing stale.
        let released = buffer.accept(vec![2], Some(180));
        assert_eq!(released, vec![vec![2]]);
    }

    #[test]
    fn full_buffer_drops_late_frames() {
        let mut buffer = ReorderBuffer::new();
        buffer.accept(vec![0], Some(10_000));
        for i in 0..TIMESTAMP_REORDER_CAPACITY {
            assert!(buffer.accept(vec![i as u8], Some(i as u32)).is_empty());
        }
        // Capacity reached: further late frames are dropped.
        assert!(buffer.accept(vec![99], Some(1)).is_empty());
        // In-order frames are unaffected.
        assert_eq!(buffer.accept(vec![7], Some(10_060)).len(), 1);
    }

    #[test]
    fn vote_needs_majority() {
        let mut vote = VadVote::new();
        assert!(!vote.push(false));
        assert!(!vote.push(true));

        let mut vote = VadVote::new();
        vote.push(true);
        vote.push(true);
        assert!(vote.push(true));
        // Window slides: three silents flip it back.
        vote.push(false);
        vote.push(false);
        assert!(!vote.push(false));
    }
}
