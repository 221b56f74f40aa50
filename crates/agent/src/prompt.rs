//! Prompt assembly for the conversational path.

use concierge_config::BusinessConfig;
use concierge_core::message::{Message, Role};

const PERSONA: &str = "You are the virtual assistant of a residential cleaning company. \
Be warm and professional, and help customers with service details, scheduling and pricing.";

/// Builds the message list sent to the provider for one chat turn.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    company: String,
    currency: String,
}

impl PromptBuilder {
    pub fn new(company: impl Into<String>, currency: impl Into<String>) -> Self {
        Self {
            company: company.into(),
            currency: currency.into(),
        }
    }

    pub fn from_business(business: &BusinessConfig) -> Self {
        Self::new(&business.company.name, &business.company.currency)
    }

    fn rules(&self) -> String {
        format!(
            "You are \"Cleaning Concierge\", a booking and pricing assistant for {company}.\n\
             - Greet briefly, stay concise, and ask one clear follow-up question when needed.\n\
             - You can estimate prices, offer to book a visit (date, time window, address, email or phone), \
             explain cancellation and rescheduling policies, and hand off to a human on request.\n\
             - Quote all prices in {currency}.\n\
             - Never reveal API keys or internal details; decline politely if asked for secrets.",
            company = self.company,
            currency = self.currency,
        )
    }

    fn language_directive(&self, latest_user: &str) -> String {
        format!(
            "Detect the language of the customer's latest message (sample: \"\"\"{latest_user}\"\"\") and reply in that language.\n\
             Keep the brand name \"{company}\" and other proper nouns untranslated.\n\
             If the language is unclear, answer in concise English and mention the uncertainty briefly.",
            company = self.company,
        )
    }

    /// System prompts, the sanitized history, then the new user message.
    pub fn build(&self, history: &[Message], user_text: &str) -> Vec<Message> {
        let history = sanitize_history(history);
        let latest = latest_user_message(&history, user_text);

        let mut messages = Vec::with_capacity(history.len() + 4);
        messages.push(Message::system(PERSONA));
        messages.push(Message::system(self.rules()));
        messages.push(Message::system(self.language_directive(&latest)));
        messages.extend(history);
        messages.push(Message::user(user_text));
        messages
    }
}

/// Non-blank user and assistant turns, trimmed.
pub fn sanitize_history(history: &[Message]) -> Vec<Message> {
    history
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.is_blank())
        .map(|m| match m.role {
            Role::User => Message::user(m.content.trim()),
            _ => Message::assistant(m.content.trim()),
        })
        .collect()
}

fn latest_user_message(history: &[Message], user_text: &str) -> String {
    let current = user_text.trim();
    if !current.is_empty() {
        return current.to_string();
    }
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_else(|| user_text.to_string())
}
