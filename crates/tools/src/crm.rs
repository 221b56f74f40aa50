//! Lead capture.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concierge_core::error::ToolError;
use concierge_core::tool::{Tool, ToolContext, parse_arguments};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactMethod {
    Email,
    Phone,
}

/// Arguments of `save_lead`; serialized back out in camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "snake_case"))]
pub struct Lead {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_contact_method: Option<ContactMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub lead: Lead,
}

#[async_trait]
pub trait CrmAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn save_lead(&self, lead: Lead) -> Result<LeadRecord, ToolError>;

    async fn list_leads(&self) -> Result<Vec<LeadRecord>, ToolError>;
}

pub fn check_lead(lead: &Lead) -> Result<(), ToolError> {
    if lead.name.trim().is_empty() {
        return Err(ToolError::InvalidArguments("name is required".into()));
    }
    if lead.email.trim().is_empty() {
        return Err(ToolError::InvalidArguments("email is required".into()));
    }
    Ok(())
}

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `lead_<unix millis>_<6 random base-36 chars>`
fn lead_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| char::from(BASE36[rng.random_range(0..BASE36.len())]))
        .collect();
    format!("lead_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// Keeps leads in process memory.
#[derive(Default)]
pub struct LocalCrm {
    leads: Mutex<Vec<LeadRecord>>,
}

impl LocalCrm {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CrmAdapter for LocalCrm {
    fn name(&self) -> &str {
        "local"
    }

    async fn save_lead(&self, lead: Lead) -> Result<LeadRecord, ToolError> {
        check_lead(&lead)?;
        let record = LeadRecord {
            id: lead_id(),
            created_at: Utc::now(),
            lead,
        };
        self.leads
            .lock()
            .map_err(|_| ToolError::failed("save_lead", "lead store is unavailable"))?
            .push(record.clone());
        Ok(record)
    }

    async fn list_leads(&self) -> Result<Vec<LeadRecord>, ToolError> {
        self.leads
            .lock()
            .map(|leads| leads.clone())
            .map_err(|_| ToolError::failed("save_lead", "lead store is unavailable"))
    }
}

pub struct SaveLeadTool {
    crm: Arc<dyn CrmAdapter>,
}

impl SaveLeadTool {
    pub fn new(crm: Arc<dyn CrmAdapter>) -> Self {
        Self { crm }
    }
}

#[async_trait]
impl Tool for SaveLeadTool {
    fn name(&self) -> &str {
        "save_lead"
    }

    fn description(&self) -> &str {
        "Store a prospective customer lead for follow-up."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["name", "email"],
            "properties": {
                "name": { "type": "string" },
                "email": { "type": "string" },
                "phone": { "type": "string" },
                "message": { "type": "string" },
                "preferred_contact_method": { "type": "string", "enum": ["email", "phone"] },
                "metadata": { "type": "object" }
            }
        })
    }

    fn validate(&self, arguments: &serde_json::Value) -> Result<(), ToolError> {
        check_lead(&parse_arguments(arguments)?)
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _context: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let lead = self.crm.save_lead(parse_arguments(&arguments)?).await?;
        Ok(serde_json::json!({ "lead": lead }))
    }
}
