//! Connection registry: device-id → live session handle.
//!
//! Written at session start/end, read by the scheduler when routing push
//! notifications. Sessions never reach into each other; the handle exposes
//! only the channels a foreign component may use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::scheduler::notify::NotificationPayload;
use crate::session::SessionCommand;
use crate::types::{Outbound, OutboundSender};

/// Channels into one live session.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub outbound: OutboundSender,
    pub commands: tokio::sync::mpsc::Sender<SessionCommand>,
    running: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(
        session_id: String,
        outbound: OutboundSender,
        commands: tokio::sync::mpsc::Sender<SessionCommand>,
    ) -> Self {
        Self {
            session_id,
            outbound,
            commands,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Deliver a push payload over the live socket. When `use_llm` is set
    /// the content is also spoken through the normal TTS path.
    pub async fn deliver_notification(&self, payload: &NotificationPayload) -> bool {
        let envelope = crate::protocol::ServerEnvelope::Notification {
            use_llm: payload.use_llm,
            title: payload.title.clone(),
            content: payload.content.clone(),
        };
        if self
            .outbound
            .send(Outbound::Text(envelope.to_json()))
            .await
            .is_err()
        {
            return false;
        }
        if payload.use_llm {
            let spoken = payload.content.clone();
            if self
                .commands
                .send(SessionCommand::Speak(spoken))
                .await
                .is_err()
            {
                warn!(session_id = %self.session_id, "speak command channel closed");
            }
        }
        true
    }
}

/// Concurrent map of live sessions keyed by device MAC.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register(&self, mac: &str, handle: SessionHandle) {
        let mac = mac.trim().to_uppercase();
        info!(%mac, session_id = %handle.session_id, "session registered");
        if let Some(previous) = self.sessions.write().await.insert(mac.clone(), handle) {
            // A reconnect can beat the old session's cleanup.
            previous.mark_stopped();
            warn!(%mac, "replaced a still-registered session");
        }
    }

    /// Remove the entry only if it still belongs to this session.
    pub async fn unregister(&self, mac: &str, session_id: &str) {
        let mac = mac.trim().to_uppercase();
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(&mac)
            .is_some_and(|h| h.session_id == session_id)
        {
            sessions.remove(&mac);
            info!(%mac, %session_id, "session unregistered");
        }
    }

    pub async fn lookup(&self, mac: &str) -> Option<SessionHandle> {
        let mac = mac.trim().to_uppercase();
        self.sessions
            .read()
            .await
            .get(&mac)
            .filter(|h| h.is_running())
            .cloned()
    }

    pub async fn connected_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle(session_id: &str) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (out_tx, out_rx) = mpsc::channel(8);
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        (
            SessionHandle::new(session_id.to_string(), out_tx, cmd_tx),
            out_rx,
        )
    }

    #[tokio::test]
    async fn register_lookup_unregister() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle("s1");
        registry.register("aa:bb:cc:dd:ee:ff", h).await;

        assert!(registry.lookup("AA:BB:CC:DD:EE:FF").await.is_some());
        registry.unregister("AA:BB:CC:DD:EE:FF", "s1").await;
        assert!(registry.lookup("AA:BB:CC:DD:EE:FF").await.is_none());
    }

    #[tokio::test]
    async fn unregister_ignores_foreign_session() {
        let registry = SessionRegistry::new();
        let (h1, _rx1) = handle("s1");
        registry.register("AA:BB:CC:DD:EE:FF", h1).await;

        // A stale close from an older session must not evict the new one.
        registry.unregister("AA:BB:CC:DD:EE:FF", "s0").await;
        assert!(registry.lookup("AA:BB:CC:DD:EE:FF").await.is_some());
    }

    #[tokio::test]
    async fn stopped_sessions_are_not_returned() {
        let registry = SessionRegistry::new();
        let (h, _rx) = handle("s1");
        h.mark_stopped();
        registry.register("AA:BB:CC:DD:EE:FF", h).await;
        assert!(registry.lookup("AA:BB:CC:DD:EE:FF").await.is_none());
    }

    #[tokio::test]
    async fn notification_reaches_outbound_queue() {
        let (h, mut rx) = handle("s1");
        let delivered = h
            .deliver_notification(&NotificationPayload {
                use_llm: false,
                title: "Drink".to_string(),
                content: "Water time".to_string(),
            })
            .await;
        assert!(delivered);
        match rx.recv().await.unwrap() {
            Outbound::Text(json) => {
                assert!(json.contains("\"notification\""));
                assert!(json.contains("Water time"));
            }
            other => panic!("expected text, got {other:?}"),
        }
    }
}
