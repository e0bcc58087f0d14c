//! # Clinic Voice - realtime voice calls for the practice chat widget
//!
//! This crate runs the voice side of the chat widget: it captures the
//! patient's microphone, streams it to a remote conversational agent, plays the
//! agent's speech back gap-free, stops that speech the moment the patient talks
//! over it, and lets the agent open the booking calendar mid-call.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         VoiceWidget                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │   Audio In   │→ │  Energy VAD  │→ │    Uplink    │──┐     │
//! │  │    (cpal)    │  │  (RMS 0.08)  │  │ (PCM16/b64)  │  │     │
//! │  └──────────────┘  └──────┬───────┘  └──────────────┘  │     │
//! │                           │ barge-in                   ▼     │
//! │  ┌──────────────┐  ┌──────▼───────┐           ┌────────────┐ │
//! │  │  Audio Out   │← │   Playback   │←──────────│  Duplex    │ │
//! │  │   (rodio)    │  │  Scheduler   │   audio   │  Channel   │ │
//! │  └──────────────┘  └──────────────┘           └─────┬──────┘ │
//! │            Transcript Accumulator ←─── text ────────┤        │
//! │            Tool Dispatcher ←────── tool calls ──────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod uplink;
pub mod vad;

pub use audio::{
    AudioBackend, AudioFrame, CaptureDevice, CpalCapture, FrameStream, OpenedCapture, OutputDevice,
    PlaybackEnded, RodioOutput, SystemAudio,
};
pub use config::VoiceConfig;
pub use error::{VoiceError, VoiceResult};
pub use playback::{decode_chunk, ChunkId, PlaybackChunk, PlaybackScheduler, ScheduledChunk};
pub use protocol::{
    memory_channel, AgentConnector, AgentEndpoint, DuplexChannel, FragmentMode, InboundMessage,
    MemoryChannel, MemoryConnector, OutboundMessage, Role, SessionSetup, ToolInvocation, ToolResult,
};
pub use session::{HostCallbacks, SessionState, UiVisibility, VoiceWidget, WidgetView};
pub use tools::{ReplyPolicy, ToolDispatcher, ToolHandler, ToolJob, ToolOutcome, OPEN_BOOKING_CALENDAR};
pub use transcript::{TranscriptAccumulator, TranscriptFragment, TranscriptMessage};
pub use uplink::{encode_frame, Uplink};
pub use vad::{VadConfig, VadDetector};
