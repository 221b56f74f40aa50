//! Tool trait: the abstraction over concierge capabilities.
//!
//! Tools are what give the assistant the ability to act: quote a cleaning,
//! check availability, book a visit, hand the conversation to a human.
//! Each tool pairs its parameter contract with its executor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use crate::error::ToolError;
use crate::message::Message;
use crate::provider::ToolDefinition;

/// The result of one tool call, as reported back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The tool that produced this result
    pub tool: String,

    /// Whether the tool executed successfully
    pub ok: bool,

    /// Structured output on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Error text on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(tool: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// The `tool` message content: `{ok: true, data}` or `{ok: false, error}`.
    pub fn to_content(&self) -> String {
        let body = if self.ok {
            serde_json::json!({ "ok": true, "data": self.data })
        } else {
            serde_json::json!({ "ok": false, "error": self.error })
        };
        body.to_string()
    }
}

/// What a tool can see of the turn that invoked it.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// The transcript so far, including system and tool messages
    pub conversation: Vec<Message>,

    /// Free-form request metadata supplied by the caller
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The core Tool trait.
///
/// Each tool implements this trait and is registered in the ToolRegistry.
/// The agent loop validates arguments with [`Tool::validate`] once, then
/// calls [`Tool::execute`] (possibly several times under retry).
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "quote_cleaning").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Check the arguments against the tool's contract.
    ///
    /// Failures here are reported to the model and never retried.
    fn validate(&self, arguments: &serde_json::Value) -> std::result::Result<(), ToolError>;

    /// Execute the tool with already-validated arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        context: &ToolContext,
    ) -> std::result::Result<serde_json::Value, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Deserialize tool arguments into a typed struct, mapping serde failures
/// to [`ToolError::InvalidArguments`].
pub fn parse_arguments<T: serde::de::DeserializeOwned>(
    arguments: &serde_json::Value,
) -> std::result::Result<T, ToolError> {
    serde_json::from_value(arguments.clone()).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// A registry of available tools.
///
/// Ordered by name so the catalog sent to the model is stable.
pub struct ToolRegistry {
    tools: BTreeMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// Get all tool definitions (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
