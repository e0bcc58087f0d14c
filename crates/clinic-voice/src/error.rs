//! Error types for the clinic voice engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice session engine.
///
/// Device and channel variants are terminal for a call. `Decode` and
/// `ToolDispatch` are handled locally so a single bad packet never ends a call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel handshake failed: {0}")]
    Handshake(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Audio decode error: {0}")]
    Decode(String),

    #[error("Tool dispatch error: {0}")]
    ToolDispatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl VoiceError {
    /// Whether this error ends the call (device and channel failures).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VoiceError::AudioDevice(_)
                | VoiceError::PermissionDenied(_)
                | VoiceError::AudioStream(_)
                | VoiceError::Playback(_)
                | VoiceError::Channel(_)
                | VoiceError::Handshake(_)
                | VoiceError::ChannelSend(_)
        )
    }
}

impl From<std::io::Error> for VoiceError {
    fn from(err: std::io::Error) -> Self {
        VoiceError::Io(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::PermissionDenied("input device not available".to_string())
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(VoiceError::PermissionDenied("denied".into()).is_terminal());
        assert!(VoiceError::Channel("closed".into()).is_terminal());
        assert!(!VoiceError::Decode("odd length".into()).is_terminal());
        assert!(!VoiceError::ToolDispatch("boom".into()).is_terminal());
    }
}
