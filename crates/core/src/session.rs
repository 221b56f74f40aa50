//! Session store trait: keyed conversation memory.
//!
//! One [`ConversationHistory`] per (tenant, session, client) triple. The
//! store is injected wherever history is needed so an external cache can
//! replace the in-process implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::SessionError;
use crate::message::{ConversationHistory, Message};

/// Identifies one conversation. Tenants and clients never share history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub tenant_id: String,
    pub session_id: String,
    pub client_id: String,
}

impl SessionKey {
    pub fn new(
        tenant_id: impl Into<String>,
        session_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session_id: session_id.into(),
            client_id: client_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.session_id, self.client_id)
    }
}

/// Storage for per-key conversation history.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// A human-readable name for this store (e.g., "in_memory").
    fn name(&self) -> &str;

    /// The history for `key`, creating an empty entry on first access.
    async fn get(&self, key: &SessionKey) -> Result<ConversationHistory, SessionError>;

    /// Append one completed turn.
    async fn append(
        &self,
        key: &SessionKey,
        user: Message,
        assistant: Message,
    ) -> Result<(), SessionError>;

    /// Drop the oldest messages beyond `2 * max_turns`.
    async fn trim(&self, key: &SessionKey, max_turns: usize) -> Result<(), SessionError>;

    /// Clear the history for `key`.
    async fn reset(&self, key: &SessionKey) -> Result<(), SessionError>;

    /// Append a completed turn and trim in one step.
    async fn commit_turn(
        &self,
        key: &SessionKey,
        user: Message,
        assistant: Message,
        max_turns: usize,
    ) -> Result<(), SessionError> {
        self.append(key, user, assistant).await?;
        self.trim(key, max_turns).await
    }
}
