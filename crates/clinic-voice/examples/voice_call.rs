//! Example: Voice Call
//!
//! Runs a real call against the system microphone and speaker. The remote
//! agent is a scripted in-process stand-in: it greets with a short tone,
//! echoes the user's speech activity as transcript lines, and opens the
//! booking calendar after a few seconds of uplink audio.
//!
//! Talk over the tone to see barge-in. Press Ctrl+C to hang up.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use clinic_voice::{
    encode_frame, AgentEndpoint, HostCallbacks, InboundMessage, MemoryConnector, OutboundMessage, Role,
    SessionSetup, SessionState, SystemAudio, ToolInvocation, VoiceConfig, VoiceWidget,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Uplink frames before the agent asks for the calendar (~3 s at 64 ms frames).
const FRAMES_BEFORE_BOOKING: usize = 48;

struct ConsoleHost;

#[async_trait]
impl HostCallbacks for ConsoleHost {
    async fn on_open_booking(&self) -> Result<(), String> {
        info!("📅 Booking calendar opened");
        Ok(())
    }

    fn on_session_state_changed(&self, state: &SessionState) {
        info!("📞 Call state: {:?}", state);
    }
}

/// One second of a 440 Hz tone at `rate`, as an agent audio message.
fn greeting_tone(rate: u32) -> InboundMessage {
    let samples: Vec<f32> = (0..rate)
        .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin() * 0.3)
        .collect();
    InboundMessage::Audio {
        data: B64.encode(encode_frame(&samples)),
        mime_type: format!("audio/pcm;rate={}", rate),
        utterance: None,
    }
}

async fn scripted_agent(setup: SessionSetup, mut endpoint: AgentEndpoint) {
    info!("🤖 Agent connected (session {}, uplink {})", setup.session_id, setup.input_mime_type);

    let greet = [
        InboundMessage::Transcript {
            role: Role::Agent,
            text: "Buongiorno, sono l'assistente dello studio.".to_string(),
            mode: Default::default(),
        },
        greeting_tone(setup.output_sample_rate),
        InboundMessage::TurnComplete,
    ];
    for message in greet {
        if endpoint.push(message).is_err() {
            return;
        }
    }

    let mut frames = 0usize;
    let mut booked = false;
    while let Some(message) = endpoint.outbound.recv().await {
        match message {
            OutboundMessage::Audio { .. } => {
                frames += 1;
                if frames % 16 == 0 {
                    let _ = endpoint.push(InboundMessage::Transcript {
                        role: Role::User,
                        text: ".".to_string(),
                        mode: Default::default(),
                    });
                }
                if frames >= FRAMES_BEFORE_BOOKING && !booked {
                    booked = true;
                    let _ = endpoint.push(InboundMessage::ToolCall {
                        calls: vec![ToolInvocation {
                            id: "booking-1".to_string(),
                            name: "openBookingCalendar".to_string(),
                            args: serde_json::json!({}),
                        }],
                    });
                }
            }
            OutboundMessage::Text { text } => info!("🤖 Agent heard text: {}", text),
            OutboundMessage::ToolResponse { id, result, .. } => {
                info!("🤖 Agent got tool response {}: {:?}", id, result)
            }
        }
    }
    info!("🤖 Agent disconnected after {} frames", frames);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🎤 Clinic Voice Call Demo");
    info!("=========================");

    let config = VoiceConfig::from_env();
    let backend = SystemAudio::from_config(&config);

    let (connector, mut endpoints) = MemoryConnector::new();
    tokio::spawn(async move {
        while let Some((setup, endpoint)) = endpoints.recv().await {
            tokio::spawn(scripted_agent(setup, endpoint));
        }
    });

    let widget = VoiceWidget::new(config, Arc::new(backend), Arc::new(connector), Arc::new(ConsoleHost));

    let session = widget.start_call().await?;
    info!("✅ Call {} live, speak into your microphone (Ctrl+C to hang up)", session);

    let mut state = widget.subscribe_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Hanging up..."),
        _ = async {
            while state.changed().await.is_ok() {
                if state.borrow().is_terminal() {
                    break;
                }
            }
        } => warn!("Call ended: {:?}", widget.state()),
    }

    info!("Dropped uplink frames: {}", widget.dropped_frames().await);
    widget.hang_up().await;

    info!("");
    info!("Transcript:");
    for message in widget.transcript().await {
        info!("  [{}] {:?}: {}", message.timestamp.format("%H:%M:%S"), message.role, message.text);
    }

    Ok(())
}
