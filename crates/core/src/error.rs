//! Error types for the Concierge domain.
//!
//! Each bounded context has its own `thiserror` enum. Errors that cross the
//! wire are normalized into a [`ChatError`] with a closed [`ErrorKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("{reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("{0}")]
    InvalidArguments(String),
}

impl ToolError {
    /// Shorthand for an execution failure of the named tool.
    pub fn failed(tool_name: &str, reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            tool_name: tool_name.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session storage error: {0}")]
    Storage(String),
}

// --- Wire-level error normalization ---

/// The closed set of error kinds surfaced to chat clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No provider credential is configured.
    MissingCredential,
    /// The provider could not be reached (DNS, connect, reset, timeout).
    ProviderUnreachable,
    /// The provider answered with an error status.
    ProviderError,
    /// The provider answered, but with empty content.
    NoReply,
    /// Anything else.
    ServerError,
}

impl ErrorKind {
    /// The stable wire code, e.g. `PROVIDER_UNREACHABLE`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "MISSING_CREDENTIAL",
            Self::ProviderUnreachable => "PROVIDER_UNREACHABLE",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::NoReply => "NO_REPLY",
            Self::ServerError => "SERVER_ERROR",
        }
    }

    /// HTTP status used when the source error carries none.
    pub fn default_status(&self) -> u16 {
        match self {
            Self::MissingCredential => 500,
            Self::ProviderUnreachable => 503,
            Self::ProviderError => 502,
            Self::NoReply => 502,
            Self::ServerError => 500,
        }
    }
}

/// A normalized error, serialized as `{status, error, details, reason?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{} ({status}): {details}", .error.code())]
pub struct ChatError {
    pub status: u16,
    pub error: ErrorKind,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChatError {
    pub fn new(kind: ErrorKind, details: impl Into<String>) -> Self {
        Self {
            status: kind.default_status(),
            error: kind,
            details: details.into(),
            reason: None,
        }
    }

    /// The provider returned nothing usable.
    pub fn no_reply() -> Self {
        Self::new(ErrorKind::NoReply, "Assistant returned an empty reply.")
    }

    pub fn server(details: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, details)
    }

    /// Attach the delivery reason that led to this error.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Map a provider failure onto the closed error kinds.
pub fn normalize(err: &ProviderError) -> ChatError {
    let details = err.to_string();
    match err {
        ProviderError::NotConfigured(_) => ChatError::new(ErrorKind::MissingCredential, details),
        ProviderError::Network(_) | ProviderError::Timeout(_) => {
            ChatError::new(ErrorKind::ProviderUnreachable, details)
        }
        ProviderError::ApiError { status_code, .. } if *status_code >= 400 => {
            ChatError::new(ErrorKind::ProviderError, details).with_status(*status_code)
        }
        ProviderError::ApiError { .. } | ProviderError::StreamInterrupted(_) => {
            ChatError::new(ErrorKind::ProviderError, details)
        }
        ProviderError::RateLimited { .. } => {
            ChatError::new(ErrorKind::ProviderError, details).with_status(429)
        }
        ProviderError::AuthenticationFailed(_) => {
            ChatError::new(ErrorKind::ProviderError, details).with_status(401)
        }
        ProviderError::ModelNotFound(_) => {
            ChatError::new(ErrorKind::ProviderError, details).with_status(404)
        }
    }
}

impl From<&ProviderError> for ChatError {
    fn from(err: &ProviderError) -> Self {
        normalize(err)
    }
}

impl From<ProviderError> for ChatError {
    fn from(err: ProviderError) -> Self {
        normalize(&err)
    }
}
