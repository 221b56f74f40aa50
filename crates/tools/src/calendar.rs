//! Availability slots.
//!
//! [`CalendarAdapter`] is the seam for a real scheduling backend. The local
//! adapter derives slots from the configured opening hours.

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use concierge_config::OpeningHours;
use concierge_core::error::ToolError;
use concierge_core::tool::{Tool, ToolContext, parse_arguments};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_DURATION_HOURS: f64 = 2.0;
const DEFAULT_INTERVAL_MINUTES: f64 = 60.0;
/// Nothing longer than a day fits in any opening window.
const MAX_DURATION_HOURS: f64 = 24.0;
const MAX_INTERVAL_MINUTES: f64 = 24.0 * 60.0;

/// Arguments of `check_availability`.
#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityRequest {
    pub date: String,
    #[serde(default)]
    pub duration_hours: Option<f64>,
    #[serde(default)]
    pub slot_interval_minutes: Option<f64>,
}

/// A bookable window. Timestamps are local wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub start: String,
    pub end: String,
    pub label: String,
}

#[async_trait]
pub trait CalendarAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn availability(&self, request: &AvailabilityRequest) -> Result<Vec<Slot>, ToolError>;
}

/// Parse a strict `YYYY-MM-DD` date.
pub fn parse_date(date: &str) -> Result<NaiveDate, ToolError> {
    let well_formed = date.len() == 10
        && date.bytes().enumerate().all(|(i, b)| match i {
            4 | 7 => b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !well_formed {
        return Err(ToolError::InvalidArguments(
            "date must be in YYYY-MM-DD format".into(),
        ));
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| ToolError::InvalidArguments("date is invalid".into()))
}

pub struct LocalCalendar {
    hours: OpeningHours,
}

impl LocalCalendar {
    pub fn new(hours: OpeningHours) -> Self {
        Self { hours }
    }
}

#[async_trait]
impl CalendarAdapter for LocalCalendar {
    fn name(&self) -> &str {
        "local"
    }

    async fn availability(&self, request: &AvailabilityRequest) -> Result<Vec<Slot>, ToolError> {
        let duration_hours = request.duration_hours.unwrap_or(DEFAULT_DURATION_HOURS);
        let interval = request.slot_interval_minutes.unwrap_or(DEFAULT_INTERVAL_MINUTES);
        if !duration_hours.is_finite()
            || duration_hours <= 0.0
            || duration_hours > MAX_DURATION_HOURS
        {
            return Err(ToolError::InvalidArguments(
                "duration_hours must be greater than zero and at most 24".into(),
            ));
        }
        if !interval.is_finite() || interval < 1.0 || interval > MAX_INTERVAL_MINUTES {
            return Err(ToolError::InvalidArguments(
                "slot_interval_minutes must be between 1 and 1440".into(),
            ));
        }

        let day = parse_date(&request.date)?;
        let weekend = matches!(day.weekday(), Weekday::Sat | Weekday::Sun);
        let (open, close) = self
            .hours
            .for_day(weekend)
            .map_err(|e| ToolError::failed("check_availability", e.to_string()))?;

        let duration = (duration_hours * 60.0).round() as u32;
        let step = interval.round() as usize;
        let midnight = day.and_time(chrono::NaiveTime::MIN);

        let slots = (open..)
            .step_by(step)
            .take_while(|start| start.checked_add(duration).is_some_and(|end| end <= close))
            .map(|start| {
                let from = midnight + Duration::minutes(i64::from(start));
                let to = from + Duration::minutes(i64::from(duration));
                Slot {
                    start: iso(from),
                    end: iso(to),
                    label: format!("{} - {}", from.format("%H:%M"), to.format("%H:%M")),
                }
            })
            .collect();
        Ok(slots)
    }
}

fn iso(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub struct AvailabilityTool {
    calendar: Arc<dyn CalendarAdapter>,
}

impl AvailabilityTool {
    pub fn new(calendar: Arc<dyn CalendarAdapter>) -> Self {
        Self { calendar }
    }

    fn parse(&self, arguments: &serde_json::Value) -> Result<AvailabilityRequest, ToolError> {
        let request: AvailabilityRequest = parse_arguments(arguments)?;
        parse_date(&request.date)?;
        if request
            .duration_hours
            .is_some_and(|h| !(0.5..=MAX_DURATION_HOURS).contains(&h))
        {
            return Err(ToolError::InvalidArguments(
                "duration_hours must be between 0.5 and 24".into(),
            ));
        }
        if request
            .slot_interval_minutes
            .is_some_and(|m| !(15.0..=MAX_INTERVAL_MINUTES).contains(&m))
        {
            return Err(ToolError::InvalidArguments(
                "slot_interval_minutes must be between 15 and 1440".into(),
            ));
        }
        Ok(request)
    }
}

#[async_trait]
impl Tool for AvailabilityTool {
    fn name(&self) -> &str {
        "check_availability"
    }

    fn description(&self) -> &str {
        "Return available time slots for a given date."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["date"],
            "properties": {
                "date": { "type": "string", "description": "Target date in YYYY-MM-DD format" },
                "duration_hours": { "type": "number", "minimum": 0.5, "maximum": 24 },
                "slot_interval_minutes": { "type": "number", "minimum": 15, "maximum": 1440 }
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
        let slots = self.calendar.availability(&request).await?;
        Ok(serde_json::json!({ "slots": slots }))
    }
}
