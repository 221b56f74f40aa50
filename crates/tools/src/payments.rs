//! Payment link generation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use concierge_core::error::ToolError;
use concierge_core::event::{DomainEvent, EventBus};
use concierge_core::tool::{Tool, ToolContext, parse_arguments};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

use crate::quote::round2;

const LINK_EXPIRY_MINUTES: i64 = 60;
const DEFAULT_CHECKOUT_URL: &str = "https://pay.cleaning.local/checkout";

/// Arguments of `generate_payment_link`.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentLinkRequest {
    pub booking_id: String,
    pub amount: f64,
    pub currency: String,
    /// Scalar values only; forwarded as `meta_<key>` query parameters
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLink {
    pub url: String,
    pub booking_id: String,
    pub amount: f64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn create_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink, ToolError>;
}

pub fn check_request(request: &PaymentLinkRequest) -> Result<(), ToolError> {
    if request.booking_id.trim().is_empty() {
        return Err(ToolError::InvalidArguments("booking_id is required".into()));
    }
    if !request.amount.is_finite() || request.amount <= 0.0 {
        return Err(ToolError::InvalidArguments(
            "amount must be a positive number".into(),
        ));
    }
    if request.currency.trim().is_empty() {
        return Err(ToolError::InvalidArguments("currency is required".into()));
    }
    if let Some((key, _)) = request
        .metadata
        .iter()
        .find(|(_, v)| !(v.is_string() || v.is_number() || v.is_boolean()))
    {
        return Err(ToolError::InvalidArguments(format!(
            "metadata.{key} must be a string, number or boolean"
        )));
    }
    Ok(())
}

/// Builds checkout URLs locally, without contacting a payment processor.
pub struct LocalPayments {
    checkout_url: String,
}

impl LocalPayments {
    pub fn new(checkout_url: impl Into<String>) -> Self {
        Self {
            checkout_url: checkout_url.into(),
        }
    }
}

impl Default for LocalPayments {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKOUT_URL)
    }
}

#[async_trait]
impl PaymentAdapter for LocalPayments {
    fn name(&self) -> &str {
        "local"
    }

    async fn create_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink, ToolError> {
        check_request(request)?;
        let currency = request.currency.trim().to_uppercase();

        let mut url = Url::parse(&self.checkout_url)
            .map_err(|e| ToolError::failed("generate_payment_link", format!("bad checkout URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("booking_id", &request.booking_id)
                .append_pair("amount", &format!("{:.2}", request.amount))
                .append_pair("currency", &currency);
            for (key, value) in &request.metadata {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                query.append_pair(&format!("meta_{key}"), &value);
            }
        }

        let created_at = Utc::now();
        Ok(PaymentLink {
            url: url.to_string(),
            booking_id: request.booking_id.clone(),
            amount: round2(request.amount),
            currency,
            created_at,
            expires_at: created_at + Duration::minutes(LINK_EXPIRY_MINUTES),
        })
    }
}

pub struct PaymentLinkTool {
    payments: Arc<dyn PaymentAdapter>,
    events: Arc<EventBus>,
}

impl PaymentLinkTool {
    pub fn new(payments: Arc<dyn PaymentAdapter>, events: Arc<EventBus>) -> Self {
        Self { payments, events }
    }
}

#[async_trait]
impl Tool for PaymentLinkTool {
    fn name(&self) -> &str {
        "generate_payment_link"
    }

    fn description(&self) -> &str {
        "Create a payment link for the specified booking and amount."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["booking_id", "amount", "currency"],
            "properties": {
                "booking_id": { "type": "string" },
                "amount": { "type": "number" },
                "currency": { "type": "string" },
                "metadata": {
                    "type": "object",
                    "additionalProperties": {
                        "anyOf": [{ "type": "string" }, { "type": "number" }, { "type": "boolean" }]
                    }
                }
            }
        })
    }

    fn validate(&self, arguments: &serde_json::Value) -> Result<(), ToolError> {
        check_request(&parse_arguments(arguments)?)
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _context: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let request: PaymentLinkRequest = parse_arguments(&arguments)?;
        let link = self.payments.create_link(&request).await?;

        self.events.publish(DomainEvent::PaymentLinkGenerated {
            booking_id: link.booking_id.clone(),
            amount: link.amount,
            currency: link.currency.clone(),
            timestamp: Utc::now(),
        });

        Ok(serde_json::json!({ "paymentLink": link }))
    }
}
