//! Audio utilities: Ogg/Opus packet extraction, length-prefixed frame
//! streams, and PCM transcoding hooks.

pub mod framefile;
pub mod ogg;
pub mod transcode;

pub use ogg::OggOpusParser;
pub use transcode::{OpusEncoder, PcmDecoder, PcmPassthrough};
