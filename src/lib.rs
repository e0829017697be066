//! voxbridge - Real-time voice-assistant gateway
//!
//! Embedded devices hold a persistent WebSocket session, stream Opus
//! microphone audio up, and receive synthesized speech plus JSON control
//! envelopes back. The crate provides:
//! - the per-device session runtime and its audio pipeline
//!   (VAD -> ASR -> LLM -> sentence splitting -> TTS -> paced egress)
//! - a unified tool dispatcher over five executor backends
//! - the reminder scheduler with live-session / broker push routing
//! - the OTA provisioning handshake with one-time activation codes
//! - the framed binary protocol shared with the device

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod protocol;
pub mod audio;
pub mod cache;
pub mod dialogue;
pub mod providers;
pub mod agent;
pub mod tools;
pub mod scheduler;
pub mod session;
pub mod server;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use dialogue::{Dialogue, Message};
pub use session::{GatewayContext, Session};
pub use tools::{ActionResponse, ToolManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
