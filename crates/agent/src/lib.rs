//! Conversation engines for the concierge.
//!
//! Two paths answer customers:
//!
//! - [`ChatDelivery`] streams a plain conversational reply over a
//!   token-by-token channel, with timers and a single non-streaming fallback.
//! - [`ToolLoop`] lets the model call business tools (quotes, bookings,
//!   payments, escalation) for a bounded number of rounds and returns the
//!   final reply with what the tools produced.

pub mod abort;
pub mod delivery;
pub mod diagnostics;
pub mod prompt;
pub mod stream_event;
pub mod tool_loop;

#[cfg(test)]
mod test_support;

pub use abort::{AbortReason, AbortSignal};
pub use delivery::{ChatDelivery, ChatTurn, DeliveryState, DeliveryTiming, EventSink, EVENT_BUFFER};
pub use diagnostics::{Diagnostics, LastFailure, Marker, MarkerKind};
pub use prompt::PromptBuilder;
pub use stream_event::ChatEvent;
pub use tool_loop::{AgentReply, AgentRequest, LoopOutcome, ToolLoop};
