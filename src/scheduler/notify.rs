//! Push-notification routing.
//!
//! Both internally fired reminders and external webhook calls funnel
//! through `push_agent_notification`: deliver to the live session when one
//! is connected, otherwise publish to the broker topic `device/<MAC>` for
//! store-and-forward, otherwise report failure so the caller can retry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::server::registry::SessionRegistry;

/// The `notification` envelope body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "useLLM", default)]
    pub use_llm: bool,
    #[serde(default)]
    pub title: String,
    pub content: String,
}

/// Narrow broker contract: publish one payload to one topic,
/// at-least-once. Retention for offline devices is the broker's concern.
#[async_trait]
pub trait MqttPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), String>;
}

/// Where a payload ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Sent on the live WebSocket.
    LiveSession,
    /// Published to the broker topic.
    Broker,
    /// Neither path available; caller should retry.
    Unavailable,
}

/// Route a push payload to a device.
pub async fn push_agent_notification(
    registry: &Arc<SessionRegistry>,
    broker: Option<&Arc<dyn MqttPublisher>>,
    mac: &str,
    payload: &NotificationPayload,
) -> DeliveryOutcome {
    if let Some(handle) = registry.lookup(mac).await {
        if handle.deliver_notification(payload).await {
            debug!(%mac, "notification delivered to live session");
            return DeliveryOutcome::LiveSession;
        }
        warn!(%mac, "live session found but send failed, trying broker");
    }

    if let Some(broker) = broker {
        let topic = format!("device/{mac}");
        let body = serde_json::to_vec(&serde_json::json!({
            "type": "notification",
            "useLLM": payload.use_llm,
            "title": payload.title,
            "content": payload.content,
        }))
        .unwrap_or_default();
        match broker.publish(&topic, &body).await {
            Ok(()) => {
                debug!(%topic, "notification published to broker");
                return DeliveryOutcome::Broker;
            }
            Err(e) => warn!(%topic, error = %e, "broker publish failed"),
        }
    }

    DeliveryOutcome::Unavailable
}

/// Broker stub collecting published messages; used by tests and by
/// deployments without a broker configured.
pub struct RecordingPublisher {
    pub published: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self {
            published: std::sync::Mutex::new(Vec::new()),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MqttPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), String> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err("broker unavailable".to_string());
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}
