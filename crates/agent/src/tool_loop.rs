//! The tool-calling agent loop.
//!
//! Each round sends the conversation plus the tool catalog to the provider.
//! A reply without tool calls ends the turn. Otherwise every call is parsed,
//! looked up, validated and executed (with retry) in declaration order, and
//! its result is appended as a `tool` message before the next round. Tool
//! failures are reported back to the model and never abort the loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use concierge_config::AppConfig;
use concierge_core::error::{ChatError, ToolError};
use concierge_core::event::{DomainEvent, EventBus};
use concierge_core::message::{Message, MessageToolCall, Role};
use concierge_core::provider::{Provider, ProviderRequest};
use concierge_core::retry::{RetryPolicy, execute_with_retry_notify};
use concierge_core::tool::{ToolContext, ToolRegistry, ToolResult};
use concierge_tools::ESCALATION_TOOL;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Standing instruction prepended to every agent conversation.
pub const AGENT_INSTRUCTIONS: &str = "You are a cleaning concierge; never guess prices; \
use tools for quotes/availability/booking/payments; confirm address is inside service area; \
summarize next steps clearly; keep answers short and friendly.";

/// Reply sent when the conversation is handed to a human.
pub const HANDOFF_ACK: &str = "We’ll call you back shortly.";

/// Reply sent when the round budget runs out.
pub const EXHAUSTED_REPLY: &str = "I'm having trouble completing that request right now. \
Let's try again or check in with a human teammate.";

pub const DEFAULT_MAX_ROUNDS: usize = 6;

/// Input of one agent turn.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl AgentRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            metadata: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopOutcome {
    Completed,
    HandedOff,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub handoff_id: String,
}

/// Outcome of one agent turn.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReply {
    pub message: ReplyMessage,
    /// Tools that succeeded at least once, in first-use order
    pub tools_used: Vec<String>,
    /// Successful outputs per tool, in execution order
    pub tool_results: BTreeMap<String, Vec<Value>>,
    pub handoff: Option<Handoff>,
    pub outcome: LoopOutcome,
    /// Model round-trips performed
    #[serde(skip)]
    pub rounds: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplyMessage {
    pub role: Role,
    pub content: String,
}

impl ReplyMessage {
    fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Default)]
struct Ledger {
    tools_used: Vec<String>,
    tool_results: BTreeMap<String, Vec<Value>>,
    handoff: Option<Handoff>,
}

impl Ledger {
    fn record(&mut self, result: &ToolResult) {
        if !result.ok {
            return;
        }
        if !self.tools_used.contains(&result.tool) {
            self.tools_used.push(result.tool.clone());
        }
        let data = result.data.clone().unwrap_or(Value::Null);
        let handoff_id = data
            .get("handoffId")
            .and_then(Value::as_str)
            .filter(|_| result.tool == ESCALATION_TOOL && self.handoff.is_none());
        if let Some(id) = handoff_id {
            self.handoff = Some(Handoff {
                handoff_id: id.to_string(),
            });
        }
        self.tool_results
            .entry(result.tool.clone())
            .or_default()
            .push(data);
    }

    fn finish(self, content: impl Into<String>, outcome: LoopOutcome, rounds: usize) -> AgentReply {
        AgentReply {
            message: ReplyMessage::assistant(content),
            tools_used: self.tools_used,
            tool_results: self.tool_results,
            handoff: self.handoff,
            outcome,
            rounds,
        }
    }
}

/// Runs tool-calling turns against a provider and a tool registry.
pub struct ToolLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    model: String,
    temperature: f32,
    max_rounds: usize,
    retry: RetryPolicy,
    events: Arc<EventBus>,
}

impl ToolLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        model: impl Into<String>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            provider,
            tools,
            model: model.into(),
            temperature: 0.6,
            max_rounds: DEFAULT_MAX_ROUNDS,
            retry: RetryPolicy::default(),
            events,
        }
    }

    pub fn from_config(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        config: &AppConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self::new(provider, tools, config.model(), events)
            .with_temperature(config.default_temperature)
            .with_max_rounds(config.agent.max_tool_rounds)
            .with_retry_policy(config.agent.retry.clone())
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the round budget. Zero is treated as one.
    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run one turn. Only provider failures are returned as errors.
    pub async fn run(&self, request: AgentRequest) -> Result<AgentReply, ChatError> {
        let AgentRequest { messages, metadata } = request;
        let mut conversation = Vec::with_capacity(messages.len() + 1);
        conversation.push(Message::system(AGENT_INSTRUCTIONS));
        conversation.extend(messages);

        let definitions = self.tools.definitions();
        let mut ledger = Ledger::default();

        for round in 1..=self.max_rounds {
            debug!(round, messages = conversation.len(), "Agent round");

            let provider_request = ProviderRequest::new(&self.model, conversation.clone())
                .with_temperature(self.temperature)
                .with_tools(definitions.clone());
            let response = self.provider.complete(provider_request).await.map_err(|e| {
                warn!(round, error = %e, "Provider failed during agent round");
                ChatError::from(&e)
            })?;

            let message = response.message;
            if message.tool_calls.is_empty() {
                info!(round, tools = ledger.tools_used.len(), "Agent turn completed");
                return Ok(ledger.finish(message.content, LoopOutcome::Completed, round));
            }

            let calls = message.tool_calls.clone();
            conversation.push(message);

            for call in &calls {
                let context = ToolContext {
                    conversation: conversation.clone(),
                    metadata: metadata.clone(),
                };
                let result = self.dispatch(call, &context).await;
                ledger.record(&result);
                conversation.push(Message::tool_result(&call.id, result.to_content()));
            }

            if let Some(handoff) = &ledger.handoff {
                info!(round, handoff_id = %handoff.handoff_id, "Agent turn handed off");
                return Ok(ledger.finish(HANDOFF_ACK, LoopOutcome::HandedOff, round));
            }
        }

        warn!(rounds = self.max_rounds, "Agent round budget exhausted");
        Ok(ledger.finish(EXHAUSTED_REPLY, LoopOutcome::Exhausted, self.max_rounds))
    }

    /// Parse, look up, validate and execute one call.
    async fn dispatch(&self, call: &MessageToolCall, context: &ToolContext) -> ToolResult {
        let arguments = match parse_call_arguments(&call.arguments) {
            Ok(arguments) => arguments,
            Err(e) => return ToolResult::failure(&call.name, e.to_string()),
        };

        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "Model requested an unknown tool");
            return ToolResult::failure(&call.name, ToolError::NotFound(call.name.clone()).to_string());
        };

        if let Err(e) = tool.validate(&arguments) {
            debug!(tool = %call.name, error = %e, "Tool arguments rejected");
            return ToolResult::failure(&call.name, e.to_string());
        }

        let started = Instant::now();
        let mut attempts = 1;
        let outcome = execute_with_retry_notify(
            &self.retry,
            || tool.execute(arguments.clone(), context),
            |attempt| {
                attempts = attempt.attempt_number + 1;
                warn!(
                    tool = %call.name,
                    attempt = attempt.attempt_number,
                    delay_ms = attempt.delay.as_millis() as u64,
                    error = %attempt.last_error,
                    "Tool failed, retrying"
                );
            },
        )
        .await;

        self.events.publish(DomainEvent::ToolExecuted {
            tool_name: call.name.clone(),
            success: outcome.is_ok(),
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });

        match outcome {
            Ok(data) => ToolResult::success(&call.name, data),
            Err(e) => {
                warn!(tool = %call.name, attempts, error = %e, "Tool failed");
                ToolResult::failure(&call.name, e.to_string())
            }
        }
    }
}

/// Arguments exactly as the model produced them; empty means `{}`.
fn parse_call_arguments(raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
        .map_err(|e| ToolError::InvalidArguments(format!("Invalid JSON arguments: {e}")))
}
