//! PCM ↔ Opus transcoding hooks.
//!
//! The gateway itself never links a codec library; provider adapters bring
//! their own (or ship pre-encoded Opus). These traits are the seam: the
//! ingress VAD needs PCM out of device frames, the egress path needs Opus
//! out of provider PCM. Tests and PCM-native deployments use the
//! passthrough implementations.

use crate::providers::ProviderError;

/// Target sample rate of the pipeline.
pub const SAMPLE_RATE: u32 = 16000;
/// Samples per frame at the default 60 ms frame duration.
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize * 60) / 1000;

/// Decodes a device audio frame into 16 kHz mono PCM samples.
pub trait PcmDecoder: Send + Sync {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, ProviderError>;
}

/// Encodes 16 kHz mono PCM into Opus frames of the negotiated duration.
pub trait OpusEncoder: Send + Sync {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<Vec<u8>>, ProviderError>;
}

/// Treats the payload as raw little-endian 16-bit PCM. Used when the
/// device negotiates `format: "pcm"` and throughout the test suite.
#[derive(Debug, Default)]
pub struct PcmPassthrough;

impl PcmDecoder for PcmPassthrough {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, ProviderError> {
        Ok(frame
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect())
    }
}

impl OpusEncoder for PcmPassthrough {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<Vec<u8>>, ProviderError> {
        let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        Ok(bytes
            .chunks(FRAME_SAMPLES * 2)
            .map(|c| c.to_vec())
            .collect())
    }
}

/// Read a WAV byte buffer into 16 kHz mono PCM.
///
/// Accepts 16-bit integer WAV only; anything else is a provider contract
/// violation surfaced as `ProviderError::Other`.
pub fn wav_to_pcm(bytes: &[u8]) -> Result<Vec<i16>, ProviderError> {
    let mut reader = hound::WavReader::new(std::io::Cursor::new(bytes))
        .map_err(|e| ProviderError::Other(format!("invalid wav: {e}")))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(ProviderError::Other(format!(
            "unsupported wav format: {} bits {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }

    let samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
    let samples = samples.map_err(|e| ProviderError::Other(format!("wav read: {e}")))?;

    // Mix down to mono if the provider delivered stereo.
    let mono: Vec<i16> = if spec.channels > 1 {
        samples
            .chunks(spec.channels as usize)
            .map(|frame| {
                (frame.iter().map(|&s| s as i32).sum::<i32>() / frame.len() as i32) as i16
            })
            .collect()
    } else {
        samples
    };

    Ok(resample(&mono, spec.sample_rate, SAMPLE_RATE))
}

/// Nearest-sample resampler. Adequate for speech prompts; providers that
/// care about fidelity deliver 16 kHz directly.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    (0..out_len)
        .map(|i| {
            let src = (i as u64 * from_rate as u64 / to_rate as u64) as usize;
            samples[src.min(samples.len() - 1)]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_roundtrip() {
        let pcm: Vec<i16> = (0..FRAME_SAMPLES as i16).collect();
        let mut codec = PcmPassthrough;
        let frames = codec.encode(&pcm).unwrap();
        assert_eq!(frames.len(), 1);
        let decoded = codec.decode(&frames[0]).unwrap();
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn wav_decodes_and_resamples() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut buf, spec).unwrap();
            for i in 0..800i16 {
                writer.write_sample(i).unwrap();
            }
            writer.finalize().unwrap();
        }
        let pcm = wav_to_pcm(buf.get_ref()).unwrap();
        // 0.1 s of 8 kHz audio becomes 0.1 s of 16 kHz audio.
        assert_eq!(pcm.len(), 1600);
    }

    #[test]
    fn resample_identity() {
        let samples = vec![1i16, 2, 3];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }
}
