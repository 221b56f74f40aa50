//! Business events published by tools and the delivery engine.
//!
//! Subscribers (tests, audit sinks, analytics) observe quotes, bookings,
//! payment links, hand-offs and finished chat turns without the producers
//! knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A tool was executed (after retries)
    ToolExecuted {
        tool_name: String,
        success: bool,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A cleaning quote was computed
    QuoteIssued {
        total: f64,
        currency: String,
        timestamp: DateTime<Utc>,
    },

    /// A booking was created with pending payment
    BookingCreated {
        booking_id: String,
        total: f64,
        timestamp: DateTime<Utc>,
    },

    /// A payment link was generated
    PaymentLinkGenerated {
        booking_id: String,
        amount: f64,
        currency: String,
        timestamp: DateTime<Utc>,
    },

    /// An FAQ question was answered from the knowledge base
    FaqDeflected {
        source_type: String,
        source_key: String,
        timestamp: DateTime<Utc>,
    },

    /// The conversation was escalated to a human
    HumanHandoff {
        handoff_id: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A streamed chat turn finished (fallback reason if it degraded)
    ChatDelivered {
        request_id: String,
        fallback_reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Fan-out of [`DomainEvent`]s to any number of subscribers.
///
/// Publishing never blocks; a subscriber that falls more than `capacity`
/// events behind sees `RecvError::Lagged` and skips ahead.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: DomainEvent) -> usize {
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
