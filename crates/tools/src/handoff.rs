//! Human escalation.
//!
//! Each handoff is appended to a JSON array on disk that a human team
//! works through. Writes are serialized so concurrent escalations never
//! lose a record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concierge_core::error::ToolError;
use concierge_core::event::{DomainEvent, EventBus};
use concierge_core::message::{Message, Role};
use concierge_core::tool::{Tool, ToolContext, parse_arguments};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ESCALATION_TOOL;
use crate::crm::ContactMethod;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "snake_case"))]
pub struct HandoffContact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_contact_method: Option<ContactMethod>,
}

/// Arguments of `escalate_to_human`. Everything is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandoffRequest {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub contact: Option<HandoffContact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<&Message> for ConversationEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            name: message.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<HandoffContact>,
    pub conversation: Vec<ConversationEntry>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl HandoffRecord {
    /// Snapshot the transcript (minus system prompts) into a new record.
    pub fn new(request: HandoffRequest, context: &ToolContext) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            reason: request.reason,
            notes: request.notes,
            contact: request.contact,
            conversation: context
                .conversation
                .iter()
                .filter(|m| m.role != Role::System)
                .map(ConversationEntry::from)
                .collect(),
            metadata: context.metadata.clone(),
        }
    }
}

/// Append-only JSON inbox file.
pub struct HandoffInbox {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HandoffInbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. A missing or corrupt inbox starts a fresh array.
    pub async fn append(&self, record: &HandoffRecord) -> Result<(), ToolError> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| inbox_error("create inbox directory", e))?;
        }

        let mut entries = self.read_entries().await;
        let value = serde_json::to_value(record)
            .map_err(|e| ToolError::failed(ESCALATION_TOOL, e.to_string()))?;
        entries.push(value);

        let body = serde_json::to_string_pretty(&entries)
            .map_err(|e| ToolError::failed(ESCALATION_TOOL, e.to_string()))?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| inbox_error("write inbox", e))
    }

    /// Every record currently in the inbox, skipping entries that do not parse.
    pub async fn records(&self) -> Vec<HandoffRecord> {
        let _guard = self.lock.lock().await;
        self.read_entries()
            .await
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }

    async fn read_entries(&self) -> Vec<Value> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => entries,
            _ => {
                warn!(path = %self.path.display(), "Handoff inbox is not a JSON array, starting over");
                Vec::new()
            }
        }
    }
}

fn inbox_error(action: &str, e: std::io::Error) -> ToolError {
    ToolError::failed(ESCALATION_TOOL, format!("Failed to {action}: {e}"))
}

pub struct HandoffTool {
    inbox: Arc<HandoffInbox>,
    events: Arc<EventBus>,
}

impl HandoffTool {
    pub fn new(inbox: Arc<HandoffInbox>, events: Arc<EventBus>) -> Self {
        Self { inbox, events }
    }
}

#[async_trait]
impl Tool for HandoffTool {
    fn name(&self) -> &str {
        ESCALATION_TOOL
    }

    fn description(&self) -> &str {
        "Escalate the conversation to a human specialist when the assistant cannot help or upon request."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "reason": { "type": "string" },
                "notes": { "type": "string" },
                "contact": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "email": { "type": "string" },
                        "phone": { "type": "string" },
                        "preferred_contact_method": { "type": "string", "enum": ["email", "phone"] }
                    }
                }
            }
        })
    }

    fn validate(&self, arguments: &Value) -> Result<(), ToolError> {
        parse_arguments::<HandoffRequest>(arguments).map(|_| ())
    }

    async fn execute(&self, arguments: Value, context: &ToolContext) -> Result<Value, ToolError> {
        let request: HandoffRequest = parse_arguments(&arguments)?;
        let record = HandoffRecord::new(request, context);
        self.inbox.append(&record).await?;

        info!(handoff_id = %record.id, reason = ?record.reason, "Conversation handed to a human");
        self.events.publish(DomainEvent::HumanHandoff {
            handoff_id: record.id.clone(),
            reason: record.reason.clone(),
            timestamp: Utc::now(),
        });

        Ok(serde_json::json!({ "handoffId": record.id }))
    }
}
