//! Transcript accumulation.
//!
//! Agent text arrives as finished message units. User text arrives as
//! incremental fragments that are merged into one open user turn until the
//! agent speaks or a new call (capture epoch) begins.

use crate::protocol::{FragmentMode, Role};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// A fragment of recognized text for either speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFragment {
    pub role: Role,
    pub text: String,
    pub mode: FragmentMode,
}

/// One message of the conversation as shown in the chat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub text: String,
    /// When the message was opened.
    pub timestamp: DateTime<Utc>,
    /// Session epoch the message was captured in.
    pub epoch: u64,
    /// Still receiving fragments (user turns only).
    pub open: bool,
}

/// Merges fragments into message records.
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    messages: Vec<TranscriptMessage>,
    epoch: u64,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new capture epoch; any open user turn is closed.
    pub fn begin_epoch(&mut self, epoch: u64) {
        self.close_open_turn();
        self.epoch = epoch;
    }

    /// Apply one fragment in arrival order.
    pub fn apply(&mut self, fragment: TranscriptFragment) {
        match fragment.role {
            Role::Agent => {
                self.close_open_turn();
                self.messages.push(TranscriptMessage {
                    role: Role::Agent,
                    text: fragment.text,
                    timestamp: Utc::now(),
                    epoch: self.epoch,
                    open: false,
                });
            }
            Role::User => {
                let epoch = self.epoch;
                match self.messages.last_mut() {
                    Some(last) if last.role == Role::User && last.open && last.epoch == epoch => {
                        match fragment.mode {
                            FragmentMode::Append => last.text.push_str(&fragment.text),
                            FragmentMode::Replace => last.text = fragment.text,
                        }
                    }
                    _ => {
                        debug!(epoch, "opening user turn");
                        self.messages.push(TranscriptMessage {
                            role: Role::User,
                            text: fragment.text,
                            timestamp: Utc::now(),
                            epoch,
                            open: true,
                        });
                    }
                }
            }
        }
    }

    fn close_open_turn(&mut self) {
        if let Some(last) = self.messages.last_mut() {
            last.open = false;
        }
    }

    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.messages
    }

    /// The open user turn's text, if any.
    pub fn open_user_text(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::User && m.open)
            .map(|m| m.text.as_str())
    }
}
