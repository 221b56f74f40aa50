//! Delivery lifecycle markers.
//!
//! Every marker is logged and the most recent ones are kept for the
//! diagnostics endpoint. The last abort or fallback is also reported by
//! `/health`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// How many markers are retained.
pub const MAX_MARKERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    SseStart,
    FirstToken,
    StreamAbort,
    FallbackUsed,
    SseDone,
    SseError,
    Aborted,
}

impl MarkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SseStart => "sse_start",
            Self::FirstToken => "first_token",
            Self::StreamAbort => "stream_abort",
            Self::FallbackUsed => "fallback_used",
            Self::SseDone => "sse_done",
            Self::SseError => "sse_error",
            Self::Aborted => "aborted",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::StreamAbort | Self::FallbackUsed | Self::SseError | Self::Aborted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub kind: MarkerKind,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Request id and reason of the most recent abort, fallback or error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LastFailure {
    pub request_id: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    markers: VecDeque<Marker>,
    last: LastFailure,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    inner: Mutex<Inner>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, kind: MarkerKind, request_id: &str, reason: Option<&str>) {
        match kind {
            MarkerKind::SseError => {
                warn!(marker = kind.as_str(), request_id, reason, "Delivery marker")
            }
            _ => info!(marker = kind.as_str(), request_id, reason, "Delivery marker"),
        }

        let mut inner = self.lock();
        if let Some(reason) = reason.filter(|_| kind.is_failure()) {
            inner.last = LastFailure {
                request_id: Some(request_id.to_string()),
                reason: Some(reason.to_string()),
            };
        }
        inner.markers.push_back(Marker {
            kind,
            request_id: request_id.to_string(),
            reason: reason.map(String::from),
            at: Utc::now(),
        });
        while inner.markers.len() > MAX_MARKERS {
            inner.markers.pop_front();
        }
    }

    /// Oldest first.
    pub fn markers(&self) -> Vec<Marker> {
        self.lock().markers.iter().cloned().collect()
    }

    pub fn last_failure(&self) -> LastFailure {
        self.lock().last.clone()
    }
}
