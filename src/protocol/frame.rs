//! Framed binary protocol shared with the device.
//!
//! Two framing variants coexist on the device-facing socket. V2 is the
//! legacy 16-byte header carrying an explicit timestamp; V3 is the compact
//! 4-byte header used by newer firmware:
//!
//! ```text
//! V2: ┌─────────┬────────────┬──────────┬──────────────┬─────────────┬─────────┐
//!     │ version │ frame_type │ reserved │ timestamp_ms │ payload_len │ payload │
//!     │ u16 BE  │ u16 BE     │ 4 bytes  │ u32 BE       │ u32 BE      │         │
//!     └─────────┴────────────┴──────────┴──────────────┴─────────────┴─────────┘
//!
//! V3: ┌────────────┬──────────┬─────────────┬─────────┐
//!     │ frame_type │ reserved │ payload_len │ payload │
//!     │ u8         │ u8       │ u16 BE      │         │
//!     └────────────┴──────────┴─────────────┴─────────┘
//! ```
//!
//! V3 carries no timestamp; the server synthesizes one per session by
//! advancing a counter by the negotiated frame duration modulo 2^32.
//!
//! The codec is pure: no I/O, no logging side effects beyond errors the
//! caller decides how to surface.

use thiserror::Error;

/// Header size of a V2 frame.
pub const V2_HEADER_SIZE: usize = 16;
/// Header size of a V3 frame.
pub const V3_HEADER_SIZE: usize = 4;
/// Protocol version tag carried in V2 headers.
pub const V2_VERSION: u16 = 2;
/// Default Opus frame duration in milliseconds.
pub const DEFAULT_FRAME_DURATION_MS: u32 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("buffer too short for a frame header: {0} bytes")]
    TooShort(usize),
    #[error("payload length {declared} exceeds remaining {available} bytes")]
    Truncated { declared: usize, available: usize },
    #[error("unknown frame type {0}")]
    UnknownFrameType(u16),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    #[error("payload exceeds the V3 length field (max {max}): {len}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Payload kind carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Opus audio payload.
    Audio,
    /// UTF-8 JSON control payload.
    Control,
}

impl FrameKind {
    fn from_wire(value: u16) -> Result<Self, FrameError> {
        match value {
            0 => Ok(FrameKind::Audio),
            1 => Ok(FrameKind::Control),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }

    fn to_wire(self) -> u16 {
        match self {
            FrameKind::Audio => 0,
            FrameKind::Control => 1,
        }
    }
}

/// A decoded device frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    V2 {
        kind: FrameKind,
        timestamp_ms: u32,
        payload: Vec<u8>,
    },
    V3 {
        kind: FrameKind,
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::V2 { kind, .. } | Frame::V3 { kind, .. } => *kind,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::V2 { payload, .. } | Frame::V3 { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Frame::V2 { payload, .. } | Frame::V3 { payload, .. } => payload,
        }
    }

    /// Explicit V2 timestamp, if present.
    pub fn timestamp_ms(&self) -> Option<u32> {
        match self {
            Frame::V2 { timestamp_ms, .. } => Some(*timestamp_ms),
            Frame::V3 { .. } => None,
        }
    }
}

/// Decide whether a binary message looks like a V2 frame.
///
/// V2 is probed first for backwards compatibility: a 16-byte-or-longer
/// message whose first two big-endian words are the version tag and a known
/// frame type.
fn looks_like_v2(buf: &[u8]) -> bool {
    if buf.len() < V2_HEADER_SIZE {
        return false;
    }
    let version = u16::from_be_bytes([buf[0], buf[1]]);
    let frame_type = u16::from_be_bytes([buf[2], buf[3]]);
    version == V2_VERSION && frame_type <= 1
}

/// Decode a framed binary message, trying V2 first, then V3.
pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
    if looks_like_v2(buf) {
        return decode_v2(buf);
    }
    decode_v3(buf)
}

pub fn decode_v2(buf: &[u8]) -> Result<Frame, FrameError> {
    if buf.len() < V2_HEADER_SIZE {
        return Err(FrameError::TooShort(buf.len()));
    }
    let version = u16::from_be_bytes([buf[0], buf[1]]);
    if version != V2_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }
    let kind = FrameKind::from_wire(u16::from_be_bytes([buf[2], buf[3]]))?;
    let timestamp_ms = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let payload_len = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]) as usize;
    let available = buf.len() - V2_HEADER_SIZE;
    if payload_len > available {
        return Err(FrameError::Truncated {
            declared: payload_len,
            available,
        });
    }
    Ok(Frame::V2 {
        kind,
        timestamp_ms,
        payload: buf[V2_HEADER_SIZE..V2_HEADER_SIZE + payload_len].to_vec(),
    })
}

pub fn decode_v3(buf: &[u8]) -> Result<Frame, FrameError> {
    if buf.len() < V3_HEADER_SIZE {
        return Err(FrameError::TooShort(buf.len()));
    }
    let kind = FrameKind::from_wire(buf[0] as u16)?;
    let payload_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let available = buf.len() - V3_HEADER_SIZE;
    if payload_len > available {
        return Err(FrameError::Truncated {
            declared: payload_len,
            available,
        });
    }
    Ok(Frame::V3 {
        kind,
        payload: buf[V3_HEADER_SIZE..V3_HEADER_SIZE + payload_len].to_vec(),
    })
}

/// Encode a frame back to wire bytes.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    match frame {
        Frame::V2 {
            kind,
            timestamp_ms,
            payload,
        } => {
            let mut out = Vec::with_capacity(V2_HEADER_SIZE + payload.len());
            out.extend_from_slice(&V2_VERSION.to_be_bytes());
            out.extend_from_slice(&kind.to_wire().to_be_bytes());
            out.extend_from_slice(&[0u8; 4]);
            out.extend_from_slice(&timestamp_ms.to_be_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(payload);
            Ok(out)
        }
        Frame::V3 { kind, payload } => {
            if payload.len() > u16::MAX as usize {
                return Err(FrameError::PayloadTooLarge {
                    len: payload.len(),
                    max: u16::MAX as usize,
                });
            }
            let mut out = Vec::with_capacity(V3_HEADER_SIZE + payload.len());
            out.push(kind.to_wire() as u8);
            out.push(0);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            out.extend_from_slice(payload);
            Ok(out)
        }
    }
}

/// Per-session synthesizer for V3 timestamps.
///
/// Returns the current value and advances by the frame duration modulo
/// 2^32, matching the explicit timestamps V2 firmware would have sent.
#[derive(Debug)]
pub struct TimestampSynthesizer {
    current: u32,
    frame_duration_ms: u32,
}

impl TimestampSynthesizer {
    pub fn new(frame_duration_ms: u32) -> Self {
        Self {
            current: 0,
            frame_duration_ms: frame_duration_ms.max(1),
        }
    }

    pub fn next(&mut self) -> u32 {
        let ts = self.current;
        self.current = self.current.wrapping_add(self.frame_duration_ms);
        ts
    }

    pub fn frame_duration_ms(&self) -> u32 {
        self.frame_duration_ms
    }
}

impl Default for TimestampSynthesizer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_DURATION_MS)
    }
}
