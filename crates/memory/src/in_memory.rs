//! In-memory session store: the default for a single process.
//!
//! History does not survive a restart.

use async_trait::async_trait;
use concierge_core::error::SessionError;
use concierge_core::message::{ConversationHistory, Message};
use concierge_core::session::{SessionKey, SessionStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// A session store backed by a `HashMap` behind an async `RwLock`.
///
/// Clones share the same map.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionKey, ConversationHistory>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a history entry.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn get(&self, key: &SessionKey) -> Result<ConversationHistory, SessionError> {
        if let Some(history) = self.sessions.read().await.get(key) {
            return Ok(history.clone());
        }
        let mut sessions = self.sessions.write().await;
        Ok(sessions.entry(key.clone()).or_default().clone())
    }

    async fn append(
        &self,
        key: &SessionKey,
        user: Message,
        assistant: Message,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(key.clone()).or_default().push_turn(user, assistant);
        Ok(())
    }

    async fn trim(&self, key: &SessionKey, max_turns: usize) -> Result<(), SessionError> {
        if let Some(history) = self.sessions.write().await.get_mut(key) {
            history.trim(max_turns);
        }
        Ok(())
    }

    async fn reset(&self, key: &SessionKey) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(key.clone(), ConversationHistory::new());
        debug!(session = %key, "Session history reset");
        Ok(())
    }
}
