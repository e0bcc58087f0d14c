//! Duplex channel contract with the remote conversational agent.
//!
//! The transport is abstract: anything that can move [`OutboundMessage`]s out
//! and [`InboundMessage`]s in can back a call. Messages serialize as JSON
//! objects tagged by `"type"`; PCM travels base64-encoded.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Speaker of a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

/// How a fragment combines with the open message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentMode {
    #[default]
    Append,
    Replace,
}

/// A function invocation requested by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Opaque request id, echoed in the response.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Outcome reported back for a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Success {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Failure {
        error: String,
    },
}

/// Messages the client sends to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// One captured frame as base64 16-bit little-endian PCM.
    Audio { data: String, mime_type: String },
    /// Text injected into the conversation (auto-greet, typed input).
    Text { text: String },
    /// Answer to a [`ToolInvocation`], correlated by id.
    ToolResponse {
        id: String,
        name: String,
        result: ToolResult,
    },
}

/// Messages the agent sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Synthesized speech as base64 16-bit little-endian PCM.
    Audio {
        data: String,
        mime_type: String,
        /// Utterance tag, when the agent provides one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        utterance: Option<u64>,
    },
    /// Recognized text for either speaker.
    Transcript {
        role: Role,
        text: String,
        #[serde(default)]
        mode: FragmentMode,
    },
    /// One or more function invocations.
    ToolCall { calls: Vec<ToolInvocation> },
    /// The agent finished its current utterance.
    TurnComplete,
    /// The agent acknowledged an interruption and dropped its utterance.
    Interrupted,
}

impl OutboundMessage {
    pub fn to_json(&self) -> VoiceResult<String> {
        serde_json::to_string(self).map_err(|e| VoiceError::Channel(e.to_string()))
    }
}

impl InboundMessage {
    pub fn from_json(text: &str) -> VoiceResult<Self> {
        serde_json::from_str(text).map_err(|e| VoiceError::Decode(e.to_string()))
    }
}

/// Parameters for the channel handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub session_id: String,
    /// Mime type of uplink audio, e.g. `audio/pcm;rate=16000`.
    pub input_mime_type: String,
    /// Rate the client plays agent audio at when untagged.
    pub output_sample_rate: u32,
}

/// Bidirectional message stream to the agent.
///
/// `recv` is polled inside `tokio::select!` and must be cancel-safe.
#[async_trait]
pub trait DuplexChannel: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> VoiceResult<()>;

    /// Next inbound message; `None` once the remote side has closed.
    async fn recv(&self) -> Option<VoiceResult<InboundMessage>>;

    async fn close(&self) -> VoiceResult<()>;
}

/// Opens channels; `connect` returns only after the handshake succeeded.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, setup: &SessionSetup) -> VoiceResult<Box<dyn DuplexChannel>>;
}

/// Client half of an in-process channel.
pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    inbound: Mutex<mpsc::UnboundedReceiver<VoiceResult<InboundMessage>>>,
    closed: std::sync::atomic::AtomicBool,
}

/// Agent half of an in-process channel.
pub struct AgentEndpoint {
    pub inbound: mpsc::UnboundedSender<VoiceResult<InboundMessage>>,
    pub outbound: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl AgentEndpoint {
    /// Deliver a message to the client.
    pub fn push(&self, message: InboundMessage) -> VoiceResult<()> {
        self.inbound
            .send(Ok(message))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    /// Deliver a transport failure to the client.
    pub fn fail(&self, error: VoiceError) -> VoiceResult<()> {
        self.inbound
            .send(Err(error))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    /// Drain everything the client has sent so far.
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(m) = self.outbound.try_recv() {
            messages.push(m);
        }
        messages
    }
}

/// Build a connected in-process channel pair.
pub fn memory_channel() -> (MemoryChannel, AgentEndpoint) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        MemoryChannel {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            closed: std::sync::atomic::AtomicBool::new(false),
        },
        AgentEndpoint {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

#[async_trait]
impl DuplexChannel for MemoryChannel {
    async fn send(&self, message: OutboundMessage) -> VoiceResult<()> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(VoiceError::Channel("channel closed".to_string()));
        }
        self.outbound
            .send(message)
            .map_err(|_| VoiceError::Channel("agent hung up".to_string()))
    }

    async fn recv(&self) -> Option<VoiceResult<InboundMessage>> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return None;
        }
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) -> VoiceResult<()> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.inbound.lock().await.close();
        debug!("memory channel closed");
        Ok(())
    }
}

/// Connector that hands the agent side of every new in-process channel to a receiver.
pub struct MemoryConnector {
    endpoints: mpsc::UnboundedSender<(SessionSetup, AgentEndpoint)>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(SessionSetup, AgentEndpoint)>) {
        let (endpoints, rx) = mpsc::unbounded_channel();
        (Self { endpoints }, rx)
    }
}

#[async_trait]
impl AgentConnector for MemoryConnector {
    async fn connect(&self, setup: &SessionSetup) -> VoiceResult<Box<dyn DuplexChannel>> {
        let (channel, endpoint) = memory_channel();
        self.endpoints
            .send((setup.clone(), endpoint))
            .map_err(|_| VoiceError::Handshake("no agent is listening".to_string()))?;
        Ok(Box::new(channel))
    }
}
