//! Concierge tools.
//!
//! Seven tools give the assistant the ability to act on behalf of the
//! cleaning business: price a visit, look up open slots, book it, take
//! payment, capture a lead, answer policy questions, and escalate to a
//! human. Calendar, payments and CRM sit behind adapter traits so a real
//! backend can replace the local implementations.

pub mod booking;
pub mod calendar;
pub mod crm;
pub mod faq;
pub mod handoff;
pub mod payments;
pub mod quote;

use concierge_config::BusinessConfig;
use concierge_core::event::EventBus;
use concierge_core::tool::ToolRegistry;
use std::sync::Arc;

pub use booking::{BookingLedger, BookingTool};
pub use calendar::{AvailabilityTool, CalendarAdapter, LocalCalendar};
pub use crm::{CrmAdapter, LocalCrm, SaveLeadTool};
pub use faq::{FaqIndex, FaqTool};
pub use handoff::{HandoffInbox, HandoffTool};
pub use payments::{LocalPayments, PaymentAdapter, PaymentLinkTool};
pub use quote::{QuoteTool, calculate_quote};

/// Version tag of the tool catalog exposed over `GET /tools`.
pub const CATALOG_VERSION: &str = "2024-07";

/// The tool whose success ends a turn with a human handoff.
pub const ESCALATION_TOOL: &str = "escalate_to_human";

/// External backends the tools talk to.
#[derive(Clone)]
pub struct Adapters {
    pub calendar: Arc<dyn CalendarAdapter>,
    pub payments: Arc<dyn PaymentAdapter>,
    pub crm: Arc<dyn CrmAdapter>,
}

impl Adapters {
    /// In-process adapters derived from business configuration.
    pub fn local(business: &BusinessConfig) -> Self {
        Self {
            calendar: Arc::new(LocalCalendar::new(business.company.hours.clone())),
            payments: Arc::new(LocalPayments::default()),
            crm: Arc::new(LocalCrm::new()),
        }
    }
}

/// Build the full catalog against the given adapters.
pub fn registry_with(
    business: &BusinessConfig,
    adapters: Adapters,
    events: Arc<EventBus>,
) -> ToolRegistry {
    let business = Arc::new(business.clone());
    let ledger = Arc::new(BookingLedger::new(business.company.service_areas.clone()));
    let faq = Arc::new(FaqIndex::from_business(&business));
    let inbox = Arc::new(HandoffInbox::new(business.handoff_inbox.clone()));

    let mut registry = ToolRegistry::new();
    registry.register(Box::new(QuoteTool::new(business.clone(), events.clone())));
    registry.register(Box::new(AvailabilityTool::new(adapters.calendar)));
    registry.register(Box::new(BookingTool::new(ledger, events.clone())));
    registry.register(Box::new(PaymentLinkTool::new(adapters.payments, events.clone())));
    registry.register(Box::new(SaveLeadTool::new(adapters.crm)));
    registry.register(Box::new(FaqTool::new(faq, events.clone())));
    registry.register(Box::new(HandoffTool::new(inbox, events)));
    registry
}

/// Create the default registry with local adapters.
pub fn default_registry(business: &BusinessConfig, events: Arc<EventBus>) -> ToolRegistry {
    registry_with(business, Adapters::local(business), events)
}
