//! Voice engine configuration loaded from the environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | VOICE_CAPTURE_SAMPLE_RATE | 16000 | Microphone rate; the uplink format expects 16 kHz mono. |
//! | VOICE_FRAME_SIZE | 1024 | Samples per captured frame (64ms at 16 kHz). |
//! | VOICE_PLAYBACK_SAMPLE_RATE | 24000 | Output device rate and default rate of agent audio. |
//! | VOICE_VAD_THRESHOLD | 0.08 | RMS energy above which a frame counts as speech. |
//! | VOICE_OUTBOUND_QUEUE | 64 | Capacity of the uplink queue; overflowing frames are dropped. |
//! | VOICE_AUTO_GREET | unset | Text sent to the agent as soon as the call is live. |
//! | VOICE_INPUT_DEVICE | unset | Preferred input device name (falls back to the default device). |

use crate::error::{VoiceError, VoiceResult};
use serde::Deserialize;

/// Sample rate required by the uplink wire format.
pub const UPLINK_SAMPLE_RATE: u32 = 16_000;

/// Default rate of agent speech chunks.
pub const DOWNLINK_SAMPLE_RATE: u32 = 24_000;

/// Default RMS threshold on the [-1, 1] scale.
pub const DEFAULT_VAD_THRESHOLD: f32 = 0.08;

fn default_capture_sample_rate() -> u32 {
    UPLINK_SAMPLE_RATE
}

fn default_frame_size() -> usize {
    1024
}

fn default_playback_sample_rate() -> u32 {
    DOWNLINK_SAMPLE_RATE
}

fn default_vad_threshold() -> f32 {
    DEFAULT_VAD_THRESHOLD
}

fn default_outbound_queue() -> usize {
    64
}

/// Configuration for one voice widget.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VoiceConfig {
    /// Capture rate in Hz.
    #[serde(default = "default_capture_sample_rate")]
    pub capture_sample_rate: u32,
    /// Samples per `AudioFrame`.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    /// Output device rate in Hz.
    #[serde(default = "default_playback_sample_rate")]
    pub playback_sample_rate: u32,
    /// VAD energy threshold. Tunable; there is no single correct value.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    /// Bounded uplink queue capacity.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue_capacity: usize,
    /// Greeting injected as text when the call becomes active.
    #[serde(default)]
    pub auto_greet: Option<String>,
    /// Preferred input device name. Read by [`crate::SystemAudio::from_config`];
    /// the session itself only talks to whatever backend it was given.
    #[serde(default)]
    pub input_device: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: default_capture_sample_rate(),
            frame_size: default_frame_size(),
            playback_sample_rate: default_playback_sample_rate(),
            vad_threshold: default_vad_threshold(),
            outbound_queue_capacity: default_outbound_queue(),
            auto_greet: None,
            input_device: None,
        }
    }
}

impl VoiceConfig {
    /// Build from `VOICE_*` environment variables. Unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        Self {
            capture_sample_rate: env_parse("VOICE_CAPTURE_SAMPLE_RATE", default_capture_sample_rate()),
            frame_size: env_parse("VOICE_FRAME_SIZE", default_frame_size()),
            playback_sample_rate: env_parse("VOICE_PLAYBACK_SAMPLE_RATE", default_playback_sample_rate()),
            vad_threshold: env_parse("VOICE_VAD_THRESHOLD", default_vad_threshold()),
            outbound_queue_capacity: env_parse("VOICE_OUTBOUND_QUEUE", default_outbound_queue()),
            auto_greet: env_opt_string("VOICE_AUTO_GREET"),
            input_device: env_opt_string("VOICE_INPUT_DEVICE"),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.capture_sample_rate == 0 || self.playback_sample_rate == 0 {
            return Err(VoiceError::Config("sample rates must be non-zero".to_string()));
        }
        if self.frame_size == 0 {
            return Err(VoiceError::Config("frame size must be non-zero".to_string()));
        }
        if !self.vad_threshold.is_finite() || !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(VoiceError::Config(format!(
                "VAD threshold must be within [0, 1], got {}",
                self.vad_threshold
            )));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(VoiceError::Config("outbound queue capacity must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Duration of one captured frame in seconds.
    pub fn frame_interval_secs(&self) -> f64 {
        self.frame_size as f64 / self.capture_sample_rate as f64
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
