//! Conversation history stores for Concierge.
//!
//! All stores implement `concierge_core::SessionStore`.

pub mod in_memory;

pub use in_memory::InMemorySessionStore;
