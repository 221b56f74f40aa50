//! Booking creation with pending payment.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use concierge_core::error::ToolError;
use concierge_core::event::{DomainEvent, EventBus};
use concierge_core::tool::{Tool, ToolContext, parse_arguments};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::quote::QuoteResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub phone: String,
    pub email: String,
    pub address: String,
}

/// Arguments of `create_booking`.
#[derive(Debug, Clone, Deserialize)]
pub struct BookingRequest {
    pub customer: Customer,
    pub scheduled_start: String,
    pub scheduled_end: String,
    pub quote: QuoteResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingPayment,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub customer: Customer,
    pub scheduled_start: String,
    pub scheduled_end: String,
    pub quote: QuoteResult,
    pub status: BookingStatus,
}

/// Accepts RFC 3339 timestamps as well as local `YYYY-MM-DDTHH:MM[:SS]`
/// and bare dates.
fn is_iso_timestamp(value: &str) -> bool {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value).is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M").is_ok()
        || NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

fn require(value: &str, label: &str) -> Result<(), ToolError> {
    if value.trim().is_empty() {
        return Err(ToolError::InvalidArguments(format!("{label} is required")));
    }
    Ok(())
}

/// Shape checks that do not depend on business data.
pub fn check_request(request: &BookingRequest) -> Result<(), ToolError> {
    let c = &request.customer;
    require(&c.name, "customer.name")?;
    require(&c.phone, "customer.phone")?;
    require(&c.email, "customer.email")?;
    require(&c.address, "customer.address")?;

    for (value, label) in [
        (&request.scheduled_start, "scheduled_start"),
        (&request.scheduled_end, "scheduled_end"),
    ] {
        if !is_iso_timestamp(value) {
            return Err(ToolError::InvalidArguments(format!(
                "{label} must be an ISO timestamp"
            )));
        }
    }
    Ok(())
}

/// In-process booking ledger.
pub struct BookingLedger {
    service_areas: Vec<String>,
    bookings: Mutex<Vec<Booking>>,
}

impl BookingLedger {
    pub fn new(service_areas: Vec<String>) -> Self {
        Self {
            service_areas,
            bookings: Mutex::new(Vec::new()),
        }
    }

    /// True when the address mentions a configured service area.
    pub fn serves(&self, address: &str) -> bool {
        let address = address.to_lowercase();
        self.service_areas
            .iter()
            .map(|a| a.trim().to_lowercase())
            .any(|area| !area.is_empty() && address.contains(&area))
    }

    pub fn create(&self, request: BookingRequest) -> Result<Booking, ToolError> {
        check_request(&request)?;
        if !self.serves(&request.customer.address) {
            return Err(ToolError::failed(
                "create_booking",
                "Address is outside the supported service areas.",
            ));
        }

        let booking = Booking {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            customer: request.customer,
            scheduled_start: request.scheduled_start,
            scheduled_end: request.scheduled_end,
            quote: request.quote,
            status: BookingStatus::PendingPayment,
        };

        self.bookings
            .lock()
            .map_err(|_| ToolError::failed("create_booking", "booking ledger is unavailable"))?
            .push(booking.clone());
        Ok(booking)
    }

    pub fn list(&self) -> Vec<Booking> {
        self.bookings.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

pub struct BookingTool {
    ledger: Arc<BookingLedger>,
    events: Arc<EventBus>,
}

impl BookingTool {
    pub fn new(ledger: Arc<BookingLedger>, events: Arc<EventBus>) -> Self {
        Self { ledger, events }
    }
}

#[async_trait]
impl Tool for BookingTool {
    fn name(&self) -> &str {
        "create_booking"
    }

    fn description(&self) -> &str {
        "Create a booking entry for the client with a pending payment status."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["customer", "scheduled_start", "scheduled_end", "quote"],
            "properties": {
                "customer": {
                    "type": "object",
                    "required": ["name", "phone", "email", "address"],
                    "properties": {
                        "name": { "type": "string" },
                        "phone": { "type": "string" },
                        "email": { "type": "string" },
                        "address": { "type": "string" }
                    }
                },
                "scheduled_start": { "type": "string", "description": "ISO timestamp for visit start" },
                "scheduled_end": { "type": "string", "description": "ISO timestamp for visit end" },
                "quote": {
                    "type": "object",
                    "required": ["currency", "total", "subtotal", "breakdown"],
                    "properties": {
                        "currency": { "type": "string" },
                        "total": { "type": "number" },
                        "subtotal": { "type": "number" },
                        "breakdown": { "type": "object" }
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
        let booking = self.ledger.create(parse_arguments(&arguments)?)?;
        info!(booking_id = %booking.id, total = booking.quote.total, "Booking created");

        self.events.publish(DomainEvent::BookingCreated {
            booking_id: booking.id.clone(),
            total: booking.quote.total,
            timestamp: Utc::now(),
        });

        Ok(serde_json::json!({ "booking": booking }))
    }
}
