//! Events delivered to the caller of a streamed chat turn.
//!
//! Each event becomes one SSE block: `event: <name>` followed by a JSON
//! `data:` line. The gateway does the framing; this module only decides
//! names and payloads.

use concierge_core::error::ChatError;
use serde_json::{Value, json};

use crate::abort::AbortReason;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The turn has started.
    Start,

    /// Keep-alive while waiting.
    Heartbeat,

    /// A slice of reply text.
    Token(String),

    /// The full reply. `reason` is set when the reply came from fallback.
    Done {
        reply: String,
        reason: Option<AbortReason>,
    },

    /// The turn failed.
    Error(ChatError),

    /// The caller cancelled the turn.
    Aborted { reason: AbortReason },
}

impl ChatEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Heartbeat => "heartbeat",
            Self::Token(_) => "token",
            Self::Done { .. } => "done",
            Self::Error(_) => "error",
            Self::Aborted { .. } => "aborted",
        }
    }

    /// JSON payload for the `data:` line.
    pub fn payload(&self) -> Value {
        match self {
            Self::Start | Self::Heartbeat => json!({}),
            Self::Token(token) => json!({ "token": token }),
            Self::Done {
                reply,
                reason: None,
            } => json!({ "reply": reply }),
            Self::Done {
                reply,
                reason: Some(reason),
            } => json!({ "reply": reply, "reason": reason }),
            Self::Error(err) => serde_json::to_value(err).unwrap_or_else(|_| json!({})),
            Self::Aborted { reason } => json!({ "reason": reason }),
        }
    }
}
