//! Device-facing wire protocol: framed binary audio and JSON control
//! envelopes.

pub mod envelope;
pub mod frame;

pub use envelope::{
    AudioParams, ClientEnvelope, Features, IotState, ListenMode, ListenState, ServerEnvelope,
    TtsState,
};
pub use frame::{decode, encode, Frame, FrameError, FrameKind, TimestampSynthesizer};
