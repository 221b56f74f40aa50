//! Completion provider implementations for Concierge.
//!
//! All providers implement the `concierge_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;
