//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use tokio::sync::mpsc;

/// A message queued for the device socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// JSON control envelope.
    Text(String),
    /// Raw Opus audio payload (unframed on plain WebSocket).
    Audio(Vec<u8>),
    /// Close the socket and stop the sender. Sent once by session close.
    Close,
}

pub type OutboundSender = mpsc::Sender<Outbound>;

/// Device identity is deliberately two-headed: the wire and MQTT topics
/// speak MAC strings, the repository speaks surrogate UUIDs. Conversions
/// happen only at explicit boundaries; neither form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Stable MAC string, `AA:BB:CC:DD:EE:FF`.
    pub mac: String,
    /// Surrogate id assigned at binding time.
    pub device_id: Option<uuid::Uuid>,
}

impl DeviceIdentity {
    pub fn from_mac(mac: impl Into<String>) -> Self {
        Self {
            mac: mac.into().trim().to_uppercase(),
            device_id: None,
        }
    }

    /// MQTT-safe MAC with colons replaced.
    pub fn mac_sanitized(&self) -> String {
        self.mac.replace(':', "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_normalizes_mac() {
        let id = DeviceIdentity::from_mac(" aa:bb:cc:dd:ee:ff ");
        assert_eq!(id.mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(id.mac_sanitized(), "AA_BB_CC_DD_EE_FF");
    }
}
