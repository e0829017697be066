//! Voice activity detection adapter.

use crate::audio::transcode::PcmDecoder;
use crate::providers::ProviderError;

/// Per-frame voice decision. Implementations keep whatever internal state
/// they need (noise floor, model context) between frames.
pub trait VadProvider: Send {
    /// Returns true when the frame contains speech.
    fn is_voice(&mut self, frame: &[u8]) -> Result<bool, ProviderError>;

    /// Silence duration after speech that counts as end-of-utterance.
    fn hangover_ms(&self) -> u32 {
        800
    }

    /// Clear state between utterances.
    fn reset(&mut self) {}
}

/// RMS-energy detector over decoded PCM with an adaptive noise floor.
pub struct EnergyVad {
    decoder: Box<dyn PcmDecoder>,
    threshold: f32,
    noise_floor: f32,
    adaptation_rate: f32,
    hangover_ms: u32,
}

const DEFAULT_RMS_THRESHOLD: f32 = 200.0;
const DEFAULT_ADAPTATION_RATE: f32 = 0.05;

impl EnergyVad {
    pub fn new(decoder: Box<dyn PcmDecoder>) -> Self {
        Self {
            decoder,
            threshold: DEFAULT_RMS_THRESHOLD,
            noise_floor: 0.0,
            adaptation_rate: DEFAULT_ADAPTATION_RATE,
            hangover_ms: 800,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_hangover_ms(mut self, hangover_ms: u32) -> Self {
        self.hangover_ms = hangover_ms;
        self
    }

    fn rms_energy(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        (samples.iter().map(|&s| (s as f32).powi(2)).sum::<f32>() / samples.len() as f32).sqrt()
    }
}

impl VadProvider for EnergyVad {
    fn is_voice(&mut self, frame: &[u8]) -> Result<bool, ProviderError> {
        let pcm = self.decoder.decode(frame)?;
        let rms = Self::rms_energy(&pcm);
        let is_speech = rms > self.noise_floor + self.threshold;
        if !is_speech {
            // Track the ambient level only while silent.
            self.noise_floor =
                self.noise_floor * (1.0 - self.adaptation_rate) + rms * self.adaptation_rate;
        }
        Ok(is_speech)
    }

    fn hangover_ms(&self) -> u32 {
        self.hangover_ms
    }

    fn reset(&mut self) {
        self.noise_floor = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::transcode::PcmPassthrough;

    fn pcm_frame(amplitude: i16, samples: usize) -> Vec<u8> {
        std::iter::repeat([amplitude.to_le_bytes()[0], amplitude.to_le_bytes()[1]])
            .take(samples)
            .flatten()
            .collect()
    }

    #[test]
    fn loud_frame_is_voice() {
        let mut vad = EnergyVad::new(Box::new(PcmPassthrough));
        assert!(vad.is_voice(&pcm_frame(8000, 960)).unwrap());
    }

    #[test]
    fn silent_frame_is_not_voice() {
        let mut vad = EnergyVad::new(Box::new(PcmPassthrough));
        assert!(!vad.is_voice(&pcm_frame(0, 960)).unwrap());
        assert!(!vad.is_voice(&pcm_frame(10, 960)).unwrap());
    }

    #[test]
    fn rms_of_empty_is_zero() {
        assert_eq!(EnergyVad::rms_energy(&[]), 0.0);
        assert!(EnergyVad::rms_energy(&[1000, -1000, 1000, -1000]) > 900.0);
    }
}
