//! Control envelope routing for one session.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{ClientEnvelope, ListenMode, ListenState, ServerEnvelope};
use crate::session::audio_in::AudioIn;
use crate::session::{chat, Session};

/// Handle one text message from the device.
pub async fn handle_text(session: &Arc<Session>, raw: &str, audio_tx: &mpsc::Sender<AudioIn>) {
    session.touch_activity();

    let envelope = match serde_json::from_str::<ClientEnvelope>(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "unparseable control envelope");
            return;
        }
    };

    match envelope {
        ClientEnvelope::Hello {
            features,
            audio_params,
            ..
        } => {
            if let Some(features) = features {
                session.set_mcp_enabled(features.mcp);
            }
            let mut params = audio_params.unwrap_or_default();
            if params.frame_duration == 0 {
                params.frame_duration = crate::protocol::frame::DEFAULT_FRAME_DURATION_MS;
            }
            session.set_frame_duration_ms(params.frame_duration);
            info!(
                mcp = session.mcp_enabled(),
                frame_duration = params.frame_duration,
                "hello negotiated"
            );

            session
                .send_envelope(ServerEnvelope::Hello {
                    transport: "websocket",
                    session_id: session.session_id.clone(),
                    audio_params: params,
                })
                .await;

            // MCP-capable devices get tool discovery right away.
            if session.mcp_enabled() {
                if let Some(runtime) = session.tools_snapshot().await {
                    runtime
                        .device_mcp
                        .start_discovery(&session.session_id)
                        .await;
                }
            }
        }
        ClientEnvelope::Listen { mode, state, text } => {
            session.set_manual_listen(mode == ListenMode::Manual);
            match state {
                ListenState::Start => session.set_manual_listening(true),
                ListenState::Stop => {
                    session.set_manual_listening(false);
                    let _ = audio_tx.send(AudioIn::FlushUtterance).await;
                }
                ListenState::Detect => {
                    // Wake word detection; optional text is treated as the
                    // opening user turn.
                    if let Some(text) = text.filter(|t| !t.trim().is_empty()) {
                        if session.is_llm_busy() {
                            debug!("detect ignored, turn in flight");
                        } else {
                            let session = session.clone();
                            tokio::spawn(async move {
                                chat::run_turn(session, text, 0).await;
                            });
                        }
                    }
                }
            }
        }
        ClientEnvelope::Abort { reason } => {
            info!(?reason, "client barge-in");
            session.abort_playback();
        }
        ClientEnvelope::Iot {
            descriptors,
            states,
        } => {
            let Some(runtime) = session.tools_snapshot().await else {
                warn!("iot envelope before tool runtime ready");
                return;
            };
            if let Some(descriptors) = descriptors {
                let added = runtime.device_iot.register_descriptors(&descriptors);
                if added > 0 {
                    runtime.manager.invalidate();
                }
            }
            if let Some(states) = states {
                runtime.device_iot.update_states(&states);
            }
        }
        ClientEnvelope::Mcp { payload } => {
            if !session.mcp_enabled() {
                warn!("mcp envelope from a device that did not negotiate mcp");
                return;
            }
            let Some(runtime) = session.tools_snapshot().await else {
                warn!("mcp envelope before tool runtime ready");
                return;
            };
            if runtime.device_mcp.handle_message(&payload).await {
                runtime.manager.invalidate();
            }
        }
        ClientEnvelope::Server { action } => match action.as_deref() {
            Some("restart") => {
                info!("restart requested by device");
                session
                    .send_envelope(ServerEnvelope::Server {
                        status: "success".to_string(),
                        message: "Server is restarting...".to_string(),
                        content: json!({"action": "restart"}),
                    })
                    .await;
                // The actual restart is the supervisor's job; the session
                // just winds down.
                session.request_close().await;
            }
            other => debug!(?other, "ignoring server action"),
        },
    }
}
