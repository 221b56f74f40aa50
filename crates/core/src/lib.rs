//! # Concierge Core
//!
//! Domain types and traits shared by every concierge crate: messages, the
//! completion provider, tools and their registry, the session store, the
//! retry executor, the error taxonomy and the domain event bus.
//!
//! Implementations live in their own crates and depend inward on this one.

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod retry;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ChatError, ErrorKind};
pub use event::{DomainEvent, EventBus};
pub use message::{ConversationHistory, Message, MessageToolCall, Role};
pub use provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk};
pub use retry::{RetryAttempt, RetryPolicy, execute_with_retry, execute_with_retry_notify};
pub use session::{SessionKey, SessionStore};
pub use tool::{Tool, ToolContext, ToolRegistry, ToolResult};
