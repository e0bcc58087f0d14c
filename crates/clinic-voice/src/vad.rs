//! Energy-based Voice Activity Detection.
//!
//! One RMS measurement per frame compared against a fixed threshold. No
//! smoothing or hysteresis: a noisy transient may read as speech, which is the
//! price of reacting within a single frame.

use crate::audio::AudioFrame;
use crate::config::DEFAULT_VAD_THRESHOLD;
use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS energy on the [-1, 1] scale above which a frame is speech (default: 0.08)
    pub threshold: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_VAD_THRESHOLD,
        }
    }
}

/// Stateless RMS voice activity detector.
#[derive(Debug, Clone)]
pub struct VadDetector {
    config: VadConfig,
}

impl VadDetector {
    /// Create a new detector with the given configuration
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        if !config.threshold.is_finite() || !(0.0..=1.0).contains(&config.threshold) {
            return Err(VoiceError::Config(format!(
                "VAD threshold must be within [0, 1], got {}",
                config.threshold
            )));
        }

        info!("🎙️ Energy VAD ready (threshold: {})", config.threshold);

        Ok(Self { config })
    }

    /// Root-mean-square energy of the samples. Empty input is 0.
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum_sq / samples.len() as f64).sqrt() as f32
    }

    /// Whether the frame carries active speech.
    ///
    /// The comparison is strict, so a silent frame never counts as speech even
    /// with a zero threshold.
    pub fn is_speech(&self, frame: &AudioFrame) -> bool {
        let energy = Self::rms(&frame.samples);
        let speech = energy > self.config.threshold;
        debug!(energy, speech, "VAD frame");
        speech
    }

    /// The configured threshold.
    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn frame(samples: Vec<f32>) -> AudioFrame {
        AudioFrame {
            samples,
            sample_rate: 16000,
            captured_at: Instant::now(),
        }
    }

    #[test]
    fn test_vad_initialization() {
        let detector = VadDetector::new(VadConfig::default()).unwrap();
        assert!((detector.threshold() - 0.08).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(VadDetector::new(VadConfig { threshold: f32::NAN }).is_err());
        assert!(VadDetector::new(VadConfig { threshold: -0.1 }).is_err());
    }

    #[test]
    fn test_rms_of_constant_signal() {
        assert!((VadDetector::rms(&[0.5; 480]) - 0.5).abs() < 1e-6);
        assert!((VadDetector::rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
        assert_eq!(VadDetector::rms(&[]), 0.0);
    }

    #[test]
    fn test_silence_detection() {
        let detector = VadDetector::new(VadConfig { threshold: 0.0 }).unwrap();
        assert!(!detector.is_speech(&frame(vec![0.0; 1024])));
    }

    #[test]
    fn test_speech_detection() {
        let detector = VadDetector::new(VadConfig::default()).unwrap();
        let loud: Vec<f32> = (0..1024)
            .map(|i| if i % 2 == 0 { 0.3 } else { -0.3 })
            .collect();
        assert!(detector.is_speech(&frame(loud)));
        assert!(!detector.is_speech(&frame(vec![0.01; 1024])));
    }
}
