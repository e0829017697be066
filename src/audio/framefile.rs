//! Length-prefixed Opus frame streams.
//!
//! Pre-rendered prompts (greetings, apologies) are shipped as a flat
//! sequence of Opus frames, each prefixed with a 4-byte header:
//! `[1 byte kind, 1 byte reserved, 2 bytes big-endian length]`. The kind
//! byte is currently always zero.

use thiserror::Error;

const HEADER_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameFileError {
    #[error("frame length {declared} exceeds remaining {available} bytes")]
    Truncated { declared: usize, available: usize },
}

/// Decode every Opus frame from a frame-stream byte buffer, returning the
/// frames and the total duration covered at the given frame duration.
pub fn decode_frames(
    input: &[u8],
    frame_duration_ms: u32,
) -> Result<(Vec<Vec<u8>>, f64), FrameFileError> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while input.len() - offset >= HEADER_SIZE {
        let len = u16::from_be_bytes([input[offset + 2], input[offset + 3]]) as usize;
        let start = offset + HEADER_SIZE;
        if start + len > input.len() {
            return Err(FrameFileError::Truncated {
                declared: len,
                available: input.len() - start,
            });
        }
        frames.push(input[start..start + len].to_vec());
        offset = start + len;
    }

    let total_duration = frames.len() as f64 * frame_duration_ms as f64 / 1000.0;
    Ok((frames, total_duration))
}

/// Encode Opus frames into the length-prefixed stream format.
pub fn encode_frames(frames: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.push(0);
        out.push(0);
        out.extend_from_slice(&(frame.len().min(u16::MAX as usize) as u16).to_be_bytes());
        out.extend_from_slice(&frame[..frame.len().min(u16::MAX as usize)]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let frames = vec![vec![1u8, 2, 3], vec![], vec![9u8; 300]];
        let encoded = encode_frames(&frames);
        let (decoded, duration) = decode_frames(&encoded, 60).unwrap();
        assert_eq!(decoded, frames);
        assert!((duration - 0.18).abs() < f64::EPSILON);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut encoded = encode_frames(&[vec![7u8; 10]]);
        encoded.truncate(encoded.len() - 4);
        assert!(matches!(
            decode_frames(&encoded, 60),
            Err(FrameFileError::Truncated { .. })
        ));
    }

    #[test]
    fn empty_input_yields_no_frames() {
        let (frames, duration) = decode_frames(&[], 60).unwrap();
        assert!(frames.is_empty());
        assert_eq!(duration, 0.0);
    }
}
