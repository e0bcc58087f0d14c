//! Uplink encoding and the bounded outbound queue.
//!
//! Frames are submitted without waiting: when the queue is full (slow
//! channel) the frame is dropped and counted. Control messages share the
//! queue but wait for space, so they are never dropped and stay in order with
//! the audio around them.

use crate::audio::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{DuplexChannel, OutboundMessage};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Mime type describing uplink PCM at `sample_rate`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Convert normalized samples to 16-bit little-endian PCM.
///
/// Input is expected in [-1, 1]; anything outside saturates instead of wrapping.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let value = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Wrap a frame as an outbound audio message.
pub fn audio_message(frame: &AudioFrame) -> OutboundMessage {
    OutboundMessage::Audio {
        data: B64.encode(encode_frame(&frame.samples)),
        mime_type: pcm_mime_type(frame.sample_rate),
    }
}

/// Producer side of the outbound queue.
#[derive(Clone)]
pub struct Uplink {
    queue: mpsc::Sender<OutboundMessage>,
    dropped: Arc<AtomicU64>,
}

impl Uplink {
    /// Create the queue and spawn the writer that drains it into `channel`.
    ///
    /// A failed send is reported once on `fault_tx` and stops the writer.
    pub fn spawn(
        channel: Arc<dyn DuplexChannel>,
        capacity: usize,
        fault_tx: mpsc::UnboundedSender<VoiceError>,
    ) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = mpsc::channel::<OutboundMessage>(capacity.max(1));
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = channel.send(message).await {
                    warn!("Uplink send failed: {}", e);
                    let _ = fault_tx.send(e);
                    break;
                }
            }
            debug!("uplink writer finished");
        });
        (
            Self {
                queue,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            writer,
        )
    }

    /// Fire-and-forget submission of one captured frame.
    ///
    /// Returns false when the frame was dropped.
    pub fn submit_frame(&self, frame: &AudioFrame) -> bool {
        match self.queue.try_send(audio_message(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(total, "uplink queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a control message, waiting for space if needed.
    pub async fn send_control(&self, message: OutboundMessage) -> VoiceResult<()> {
        self.queue
            .send(message)
            .await
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    /// Frames dropped because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared counter, readable after the uplink is gone.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }
}
