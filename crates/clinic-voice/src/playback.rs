//! Downlink playback scheduling.
//!
//! Agent speech arrives as bursts of PCM chunks. Each chunk is placed on the
//! output clock at `max(next_start_time, now)` and the cursor advances by the
//! chunk's duration, so chunks play back to back without gaps or overlap.
//!
//! Barge-in cancels every chunk in flight and the utterance they belong to.
//! Chunks of that utterance that are still on the wire are dropped when they
//! arrive; audio from a newer utterance schedules normally.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use std::collections::VecDeque;
use tracing::{debug, info};

/// Identifier of a scheduled chunk, unique within a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u64);

/// Decoded agent audio ready for scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    /// Mono samples normalized to [-1, 1].
    pub samples: Vec<f32>,
    /// Rate the samples must play at.
    pub sample_rate: u32,
    /// Agent utterance the chunk belongs to, when the agent tags it.
    pub utterance: Option<u64>,
}

impl PlaybackChunk {
    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// A chunk's slot on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: ChunkId,
    /// Utterance epoch the chunk was scheduled under.
    pub epoch: u64,
    /// Start time on the output clock, seconds.
    pub start: f64,
    /// End time on the output clock, seconds.
    pub end: f64,
}

/// Decode an inbound base64 PCM payload.
///
/// `mime_type` must be `audio/pcm`, optionally with a `rate=N` parameter;
/// `default_rate` applies when the rate is absent.
pub fn decode_chunk(
    data: &str,
    mime_type: &str,
    utterance: Option<u64>,
    default_rate: u32,
) -> VoiceResult<PlaybackChunk> {
    let sample_rate = parse_pcm_rate(mime_type, default_rate)?;
    let bytes = B64.decode(data.trim())?;
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();
    Ok(PlaybackChunk {
        samples,
        sample_rate,
        utterance,
    })
}

fn parse_pcm_rate(mime_type: &str, default_rate: u32) -> VoiceResult<u32> {
    let mut parts = mime_type.split(';').map(str::trim);
    let base = parts.next().unwrap_or_default();
    if !base.eq_ignore_ascii_case("audio/pcm") {
        return Err(VoiceError::Decode(format!("unsupported mime type '{}'", mime_type)));
    }
    for param in parts {
        if let Some(rate) = param.strip_prefix("rate=") {
            return match rate.trim().parse::<u32>() {
                Ok(r) if r > 0 => Ok(r),
                _ => Err(VoiceError::Decode(format!("invalid rate in '{}'", mime_type))),
            };
        }
    }
    Ok(default_rate)
}

/// Gap-free scheduler for agent speech against a monotonic output clock.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    next_id: u64,
    /// Implicit utterance epoch, advanced on agent turn boundaries.
    utterance_epoch: u64,
    /// Highest utterance epoch cancelled by barge-in.
    cancelled_through: Option<u64>,
    in_flight: VecDeque<ScheduledChunk>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a chunk on the output clock.
    ///
    /// Returns `None` when the chunk belongs to an utterance cancelled by barge-in.
    pub fn schedule(&mut self, chunk: &PlaybackChunk, now: f64) -> Option<ScheduledChunk> {
        let epoch = chunk.utterance.unwrap_or(self.utterance_epoch);
        if let Some(cancelled) = self.cancelled_through {
            if epoch <= cancelled {
                debug!(epoch, cancelled, "dropping chunk from interrupted utterance");
                return None;
            }
        }
        if chunk.utterance.is_some() && epoch > self.utterance_epoch {
            self.utterance_epoch = epoch;
        }

        let start = self.next_start_time.max(now);
        let end = start + chunk.duration();
        self.next_start_time = end;

        let scheduled = ScheduledChunk {
            id: ChunkId(self.next_id),
            epoch,
            start,
            end,
        };
        self.next_id += 1;
        self.in_flight.push_back(scheduled);
        Some(scheduled)
    }

    /// Record that a chunk finished playing. Returns true when this drained
    /// the last chunk in flight.
    pub fn on_chunk_ended(&mut self, id: ChunkId) -> bool {
        let before = self.in_flight.len();
        self.in_flight.retain(|c| c.id != id);
        before != self.in_flight.len() && self.in_flight.is_empty()
    }

    /// Whether any chunk is scheduled or playing.
    pub fn has_audio_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Chunks currently scheduled or playing, in start order.
    pub fn in_flight(&self) -> impl Iterator<Item = &ScheduledChunk> {
        self.in_flight.iter()
    }

    /// Playback cursor: where the next chunk would start if the clock were behind it.
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// The agent finished or abandoned an utterance; later untagged audio is a new one.
    pub fn utterance_boundary(&mut self) {
        self.utterance_epoch += 1;
    }

    /// Cancel the utterances in flight. Returns the chunks that must stop now.
    ///
    /// Only epochs that actually reached the speaker are cancelled; an
    /// utterance the agent started after a turn boundary still plays.
    pub fn barge_in(&mut self) -> Vec<ChunkId> {
        if let Some(newest) = self.in_flight.iter().map(|c| c.epoch).max() {
            self.cancelled_through = Some(self.cancelled_through.map_or(newest, |c| c.max(newest)));
        }
        let stopped = self.cancel_all();
        info!(
            cancelled_through = ?self.cancelled_through,
            chunks = stopped.len(),
            "⚡ barge-in: agent playback cancelled"
        );
        stopped
    }

    /// Drop everything in flight and reset the cursor.
    pub fn cancel_all(&mut self) -> Vec<ChunkId> {
        self.next_start_time = 0.0;
        self.in_flight.drain(..).map(|c| c.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(samples: usize, utterance: Option<u64>) -> PlaybackChunk {
        PlaybackChunk {
            samples: vec![0.1; samples],
            sample_rate: 24000,
            utterance,
        }
    }

    #[test]
    fn chunks_play_back_to_back() {
        let mut scheduler = PlaybackScheduler::new();
        let durations = [2400usize, 4800, 1200, 24000];
        let scheduled: Vec<_> = durations
            .iter()
            .map(|&n| scheduler.schedule(&chunk(n, None), 1.0).unwrap())
            .collect();

        assert_eq!(scheduled[0].start, 1.0);
        for pair in scheduled.windows(2) {
            assert_eq!(pair[1].start, pair[0].end);
        }
        assert!((scheduler.next_start_time() - (1.0 + 32400.0 / 24000.0)).abs() < 1e-9);
    }

    #[test]
    fn late_chunk_starts_at_clock_time() {
        let mut scheduler = PlaybackScheduler::new();
        let first = scheduler.schedule(&chunk(2400, None), 0.0).unwrap();
        assert!((first.end - 0.1).abs() < 1e-9);
        let second = scheduler.schedule(&chunk(2400, None), 5.0).unwrap();
        assert_eq!(second.start, 5.0);
    }

    #[test]
    fn ended_drains_to_idle() {
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(&chunk(100, None), 0.0).unwrap();
        let b = scheduler.schedule(&chunk(100, None), 0.0).unwrap();
        assert!(!scheduler.on_chunk_ended(a.id));
        assert!(scheduler.has_audio_in_flight());
        assert!(scheduler.on_chunk_ended(b.id));
        assert!(!scheduler.has_audio_in_flight());
        // Unknown or repeated ids change nothing.
        assert!(!scheduler.on_chunk_ended(b.id));
    }

    #[test]
    fn barge_in_drops_stragglers_until_next_utterance() {
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(&chunk(2400, None), 0.0).unwrap();
        let b = scheduler.schedule(&chunk(2400, None), 0.0).unwrap();

        let stopped = scheduler.barge_in();
        assert_eq!(stopped, vec![a.id, b.id]);
        assert!(!scheduler.has_audio_in_flight());

        // Same utterance still arriving after the interruption.
        assert!(scheduler.schedule(&chunk(2400, None), 0.3).is_none());

        scheduler.utterance_boundary();
        let fresh = scheduler.schedule(&chunk(2400, None), 0.3).unwrap();
        assert_eq!(fresh.start, 0.3);
    }

    #[test]
    fn barge_in_after_turn_complete_keeps_next_reply() {
        let mut scheduler = PlaybackScheduler::new();
        scheduler.schedule(&chunk(24000, None), 0.0).unwrap();
        scheduler.schedule(&chunk(24000, None), 0.0).unwrap();
        // The agent finished sending before the speaker finished playing.
        scheduler.utterance_boundary();

        assert_eq!(scheduler.barge_in().len(), 2);

        let reply = scheduler.schedule(&chunk(2400, None), 0.4).unwrap();
        assert_eq!(reply.start, 0.4);
        assert!(scheduler.schedule(&chunk(2400, None), 0.4).is_some());
    }

    #[test]
    fn barge_in_with_nothing_in_flight_cancels_nothing() {
        let mut scheduler = PlaybackScheduler::new();
        assert!(scheduler.barge_in().is_empty());
        assert!(scheduler.schedule(&chunk(100, None), 0.0).is_some());
    }

    #[test]
    fn tagged_utterances_bypass_boundary_tracking() {
        let mut scheduler = PlaybackScheduler::new();
        scheduler.schedule(&chunk(100, Some(3)), 0.0).unwrap();
        scheduler.barge_in();
        assert!(scheduler.schedule(&chunk(100, Some(3)), 0.0).is_none());
        assert!(scheduler.schedule(&chunk(100, Some(2)), 0.0).is_none());
        assert!(scheduler.schedule(&chunk(100, Some(4)), 0.0).is_some());
    }

    #[test]
    fn decode_pcm_payload() {
        let bytes: Vec<u8> = [0i16, 16384, -32768]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let data = B64.encode(bytes);
        let decoded = decode_chunk(&data, "audio/pcm;rate=24000", None, 16000).unwrap();
        assert_eq!(decoded.sample_rate, 24000);
        assert_eq!(decoded.samples, vec![0.0, 0.5, -1.0]);

        let defaulted = decode_chunk(&data, "audio/pcm", Some(7), 24000).unwrap();
        assert_eq!(defaulted.sample_rate, 24000);
        assert_eq!(defaulted.utterance, Some(7));
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        let odd = B64.encode([1u8, 2, 3]);
        assert!(matches!(
            decode_chunk(&odd, "audio/pcm", None, 24000),
            Err(VoiceError::Decode(_))
        ));
        assert!(matches!(
            decode_chunk("not base64!!", "audio/pcm", None, 24000),
            Err(VoiceError::Decode(_))
        ));
        assert!(matches!(
            decode_chunk("", "audio/opus", None, 24000),
            Err(VoiceError::Decode(_))
        ));
        assert!(matches!(
            decode_chunk("", "audio/pcm;rate=abc", None, 24000),
            Err(VoiceError::Decode(_))
        ));
    }
}
