//! Cleaning quotes from the configured pricing table.

use async_trait::async_trait;
use chrono::Utc;
use concierge_config::BusinessConfig;
use concierge_core::error::ToolError;
use concierge_core::event::{DomainEvent, EventBus};
use concierge_core::tool::{Tool, ToolContext, parse_arguments};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Standard,
    Deep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    OneTime,
    Weekly,
    Biweekly,
    Monthly,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteExtras {
    #[serde(default)]
    pub inside_oven: bool,
    #[serde(default)]
    pub inside_fridge: bool,
    #[serde(default)]
    pub windows: u32,
}

/// Arguments of `quote_cleaning`.
#[derive(Debug, Clone, Deserialize)]
pub struct QuoteRequest {
    pub rooms: u32,
    pub baths: u32,
    pub square_meters: f64,
    pub service_type: ServiceType,
    pub frequency: Frequency,
    #[serde(default)]
    pub extras: Option<QuoteExtras>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtrasBreakdown {
    pub inside_oven: f64,
    pub inside_fridge: f64,
    pub windows: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteBreakdown {
    pub base_visit_fee: f64,
    pub rooms: f64,
    pub baths: f64,
    pub square_meters: f64,
    pub service_multiplier: f64,
    pub frequency_multiplier: f64,
    pub extras: ExtrasBreakdown,
}

/// A priced quote. Amounts are rounded to cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteResult {
    pub currency: String,
    pub total: f64,
    pub subtotal: f64,
    pub breakdown: QuoteBreakdown,
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Price a visit.
///
/// `subtotal` is the sum of line items; `total` applies the service and
/// frequency multipliers to the unrounded subtotal.
pub fn calculate_quote(
    business: &BusinessConfig,
    request: &QuoteRequest,
) -> Result<QuoteResult, ToolError> {
    if !request.square_meters.is_finite() || request.square_meters <= 0.0 {
        return Err(ToolError::InvalidArguments(
            "square_meters must be greater than zero".into(),
        ));
    }

    let pricing = &business.pricing;
    let addons = &business.addons;

    let rooms = f64::from(request.rooms) * pricing.per_room;
    let baths = f64::from(request.baths) * pricing.per_bath;
    let square_meters = request.square_meters * pricing.per_sqm;

    let service_multiplier = match request.service_type {
        ServiceType::Standard => 1.0,
        ServiceType::Deep => pricing.deep_clean_multiplier,
    };
    let discounts = &pricing.frequency_discounts;
    let frequency_multiplier = match request.frequency {
        Frequency::OneTime => discounts.one_time,
        Frequency::Weekly => discounts.weekly,
        Frequency::Biweekly => discounts.biweekly,
        Frequency::Monthly => discounts.monthly,
    };

    let wanted = request.extras.clone().unwrap_or_default();
    let extras = ExtrasBreakdown {
        inside_oven: if wanted.inside_oven { addons.inside_oven } else { 0.0 },
        inside_fridge: if wanted.inside_fridge { addons.inside_fridge } else { 0.0 },
        windows: addons.windows_per_room * f64::from(wanted.windows),
    };

    let subtotal = pricing.base_visit_fee
        + rooms
        + baths
        + square_meters
        + extras.inside_oven
        + extras.inside_fridge
        + extras.windows;

    Ok(QuoteResult {
        currency: business.company.currency.clone(),
        total: round2(subtotal * service_multiplier * frequency_multiplier),
        subtotal: round2(subtotal),
        breakdown: QuoteBreakdown {
            base_visit_fee: pricing.base_visit_fee,
            rooms,
            baths,
            square_meters,
            service_multiplier,
            frequency_multiplier,
            extras,
        },
    })
}

pub struct QuoteTool {
    business: Arc<BusinessConfig>,
    events: Arc<EventBus>,
}

impl QuoteTool {
    pub fn new(business: Arc<BusinessConfig>, events: Arc<EventBus>) -> Self {
        Self { business, events }
    }

    fn parse(&self, arguments: &serde_json::Value) -> Result<QuoteRequest, ToolError> {
        let request: QuoteRequest = parse_arguments(arguments)?;
        if !request.square_meters.is_finite() || request.square_meters < 1.0 {
            return Err(ToolError::InvalidArguments(
                "square_meters must be at least 1".into(),
            ));
        }
        Ok(request)
    }
}

#[async_trait]
impl Tool for QuoteTool {
    fn name(&self) -> &str {
        "quote_cleaning"
    }

    fn description(&self) -> &str {
        "Calculate a cleaning quote using the official pricing table."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["rooms", "baths", "square_meters", "service_type", "frequency"],
            "properties": {
                "rooms": { "type": "integer", "minimum": 0 },
                "baths": { "type": "integer", "minimum": 0 },
                "square_meters": { "type": "number", "minimum": 1 },
                "service_type": { "type": "string", "enum": ["standard", "deep"] },
                "frequency": { "type": "string", "enum": ["one_time", "weekly", "biweekly", "monthly"] },
                "extras": {
                    "type": "object",
                    "properties": {
                        "inside_oven": { "type": "boolean" },
                        "inside_fridge": { "type": "boolean" },
                        "windows": { "type": "integer", "minimum": 0 }
                    }
                }
            }
        })
    }

    fn validate(&self, arguments: &serde_json::Value) -> Result<(), ToolError> {
        self.parse(arguments).map(|_| ())
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        _context: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let request = self.parse(&arguments)?;
        let result = calculate_quote(&self.business, &request)?;

        self.events.publish(DomainEvent::QuoteIssued {
            total: result.total,
            currency: result.currency.clone(),
            timestamp: Utc::now(),
        });

        Ok(serde_json::json!({ "result": result }))
    }
}
