//! Cooperative cancellation for one streamed chat turn.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Why a provider stream was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    FirstTokenTimeout,
    OverallTimeout,
    StreamSetupFailure,
    StreamRuntimeFailure,
    EmptyStreamReply,
    UserAbort,
    ClientWatchdog,
    ClientDisconnect,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstTokenTimeout => "first_token_timeout",
            Self::OverallTimeout => "overall_timeout",
            Self::StreamSetupFailure => "stream_setup_failure",
            Self::StreamRuntimeFailure => "stream_runtime_failure",
            Self::EmptyStreamReply => "empty_stream_reply",
            Self::UserAbort => "user_abort",
            Self::ClientWatchdog => "client_watchdog",
            Self::ClientDisconnect => "client_disconnect",
        }
    }

    /// Reasons raised from the caller's side. These end the turn without fallback.
    pub fn is_client_initiated(&self) -> bool {
        matches!(
            self,
            Self::UserAbort | Self::ClientWatchdog | Self::ClientDisconnect
        )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A shared abort flag with a first-wins reason.
///
/// Clones observe the same signal. Once raised it stays raised; later
/// reasons are ignored.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `true` if this call recorded the reason.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.get().copied()
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal is raised.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
