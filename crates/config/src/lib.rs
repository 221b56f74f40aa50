//! Configuration loading, validation, and management for Concierge.
//!
//! Loads configuration from `~/.concierge/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use concierge_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Model used when none is configured or the configured name is unusable.
pub const FALLBACK_MODEL: &str = "gpt-4o-mini";

/// The root configuration structure.
///
/// Maps directly to `~/.concierge/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Completion provider API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// HTTP gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Streaming delivery timers
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Conversation history bounds
    #[serde(default)]
    pub history: HistoryConfig,

    /// Tool-calling loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Company facts, pricing, and policies
    #[serde(default)]
    pub business: BusinessConfig,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    FALLBACK_MODEL.into()
}
fn default_temperature() -> f32 {
    0.6
}
fn default_true() -> bool {
    true
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("gateway", &self.gateway)
            .field("streaming", &self.streaming)
            .field("history", &self.history)
            .field("agent", &self.agent)
            .field("business", &self.business)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret expected in `x-bot-token`; the gateway will not start without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,

    /// Requests per minute per client; 0 disables limiting
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,

    /// Expose `/diag/last`
    #[serde(default)]
    pub diagnostics: bool,

    /// Terms rejected by the agent endpoint (case-insensitive substring match)
    #[serde(default = "default_banned_terms")]
    pub banned_terms: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    3000
}
fn default_rate_limit() -> u32 {
    60
}
fn default_banned_terms() -> Vec<String> {
    ["fuck", "shit", "bitch", "asshole", "bastard", "cunt"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bot_token: None,
            rate_limit_per_minute: default_rate_limit(),
            diagnostics: false,
            banned_terms: default_banned_terms(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("bot_token", &redact(&self.bot_token))
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("diagnostics", &self.diagnostics)
            .field("banned_terms", &self.banned_terms.len())
            .finish()
    }
}

/// Timers of the streaming delivery state machine, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_first_token_timeout")]
    pub first_token_timeout_ms: u64,

    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_ms: u64,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,

    #[serde(default = "default_replay_min")]
    pub replay_delay_min_ms: u64,

    #[serde(default = "default_replay_max")]
    pub replay_delay_max_ms: u64,
}

fn default_first_token_timeout() -> u64 {
    4_000
}
fn default_overall_timeout() -> u64 {
    45_000
}
fn default_heartbeat() -> u64 {
    10_000
}
fn default_replay_min() -> u64 {
    25
}
fn default_replay_max() -> u64 {
    40
}

impl StreamingConfig {
    pub fn first_token_timeout(&self) -> Duration {
        Duration::from_millis(self.first_token_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Inclusive bounds of the gap between replayed fallback tokens.
    pub fn replay_delay(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.replay_delay_min_ms),
            Duration::from_millis(self.replay_delay_max_ms),
        )
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            first_token_timeout_ms: default_first_token_timeout(),
            overall_timeout_ms: default_overall_timeout(),
            heartbeat_ms: default_heartbeat(),
            replay_delay_min_ms: default_replay_min(),
            replay_delay_max_ms: default_replay_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Turns (user + assistant pairs) kept per session
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_max_turns() -> usize {
    20
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model round-trips allowed per agent turn
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,

    /// Retry policy wrapped around every tool execution
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_tool_rounds() -> usize {
    6
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            retry: RetryPolicy::default(),
        }
    }
}

/// What the assistant knows about the business it represents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusinessConfig {
    #[serde(default)]
    pub company: CompanyConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    pub addons: AddonsConfig,

    #[serde(default)]
    pub policies: PoliciesConfig,

    /// JSON file that receives human hand-off records
    #[serde(default = "default_handoff_inbox")]
    pub handoff_inbox: PathBuf,

    /// Directory of markdown documents searched by the FAQ tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_dir: Option<PathBuf>,
}

fn default_handoff_inbox() -> PathBuf {
    AppConfig::config_dir().join("handoffs.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyConfig {
    #[serde(default = "default_company_name")]
    pub name: String,

    #[serde(default = "default_currency")]
    pub currency: String,

    /// Substrings matched case-insensitively against booking addresses
    #[serde(default = "default_service_areas")]
    pub service_areas: Vec<String>,

    #[serde(default)]
    pub hours: OpeningHours,
}

fn default_company_name() -> String {
    "Bright Home Cleaning".into()
}
fn default_currency() -> String {
    "USD".into()
}
fn default_service_areas() -> Vec<String> {
    ["San Francisco", "Oakland", "Berkeley", "Daly City"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for CompanyConfig {
    fn default() -> Self {
        Self {
            name: default_company_name(),
            currency: default_currency(),
            service_areas: default_service_areas(),
            hours: OpeningHours::default(),
        }
    }
}

/// Opening hours as `HH:MM-HH:MM` ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpeningHours {
    #[serde(default = "default_weekday_hours")]
    pub weekdays: String,

    #[serde(default = "default_weekend_hours")]
    pub weekends: String,
}

fn default_weekday_hours() -> String {
    "08:00-18:00".into()
}
fn default_weekend_hours() -> String {
    "09:00-14:00".into()
}

impl OpeningHours {
    /// The range for a day, as minutes since midnight.
    pub fn for_day(&self, weekend: bool) -> Result<(u32, u32), ConfigError> {
        parse_hours(if weekend { &self.weekends } else { &self.weekdays })
    }
}

impl Default for OpeningHours {
    fn default() -> Self {
        Self {
            weekdays: default_weekday_hours(),
            weekends: default_weekend_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_base_visit_fee")]
    pub base_visit_fee: f64,

    #[serde(default = "default_per_room")]
    pub per_room: f64,

    #[serde(default = "default_per_bath")]
    pub per_bath: f64,

    #[serde(default = "default_per_sqm")]
    pub per_sqm: f64,

    #[serde(default = "default_deep_clean_multiplier")]
    pub deep_clean_multiplier: f64,

    #[serde(default)]
    pub frequency_discounts: FrequencyDiscounts,
}

fn default_base_visit_fee() -> f64 {
    40.0
}
fn default_per_room() -> f64 {
    20.0
}
fn default_per_bath() -> f64 {
    16.0
}
fn default_per_sqm() -> f64 {
    0.8
}
fn default_deep_clean_multiplier() -> f64 {
    1.4
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            base_visit_fee: default_base_visit_fee(),
            per_room: default_per_room(),
            per_bath: default_per_bath(),
            per_sqm: default_per_sqm(),
            deep_clean_multiplier: default_deep_clean_multiplier(),
            frequency_discounts: FrequencyDiscounts::default(),
        }
    }
}

/// Price multipliers per visit frequency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyDiscounts {
    #[serde(default = "one")]
    pub one_time: f64,
    #[serde(default = "default_weekly")]
    pub weekly: f64,
    #[serde(default = "default_biweekly")]
    pub biweekly: f64,
    #[serde(default = "default_monthly")]
    pub monthly: f64,
}

fn one() -> f64 {
    1.0
}
fn default_weekly() -> f64 {
    0.85
}
fn default_biweekly() -> f64 {
    0.9
}
fn default_monthly() -> f64 {
    0.95
}

impl Default for FrequencyDiscounts {
    fn default() -> Self {
        Self {
            one_time: one(),
            weekly: default_weekly(),
            biweekly: default_biweekly(),
            monthly: default_monthly(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonsConfig {
    #[serde(default = "default_inside_oven")]
    pub inside_oven: f64,

    #[serde(default = "default_inside_fridge")]
    pub inside_fridge: f64,

    #[serde(default = "default_windows_per_room")]
    pub windows_per_room: f64,
}

fn default_inside_oven() -> f64 {
    30.0
}
fn default_inside_fridge() -> f64 {
    25.0
}
fn default_windows_per_room() -> f64 {
    12.0
}

impl Default for AddonsConfig {
    fn default() -> Self {
        Self {
            inside_oven: default_inside_oven(),
            inside_fridge: default_inside_fridge(),
            windows_per_room: default_windows_per_room(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoliciesConfig {
    #[serde(default = "default_cancellation_policy")]
    pub cancellation: String,

    #[serde(default = "default_supplies_policy")]
    pub supplies: String,
}

fn default_cancellation_policy() -> String {
    "Free cancellation up to 24 hours before the visit. Later cancellations are charged 50% of the quote.".into()
}
fn default_supplies_policy() -> String {
    "Our cleaners bring all supplies and equipment. Tell us if you prefer specific products.".into()
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            cancellation: default_cancellation_policy(),
            supplies: default_supplies_policy(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.concierge/config.toml).
    ///
    /// Environment variables override the file:
    /// - `CONCIERGE_API_KEY`, then `OPENAI_API_KEY`
    /// - `CONCIERGE_MODEL`, then `OPENAI_MODEL`
    /// - `CONCIERGE_BOT_TOKEN`
    /// - `PORT`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_env(&Self::config_dir().join("config.toml"))
    }

    /// Load from a specific path, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production). Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(key) = var("CONCIERGE_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
            self.api_key = Some(key);
        }
        if let Some(model) = var("CONCIERGE_MODEL").or_else(|| var("OPENAI_MODEL")) {
            self.default_model = model;
        }
        if let Some(token) = var("CONCIERGE_BOT_TOKEN") {
            self.gateway.bot_token = Some(token);
        }
        if let Some(port) = var("PORT") {
            match port.trim().parse() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid PORT"),
            }
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".concierge")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let streaming = &self.streaming;
        if streaming.first_token_timeout_ms == 0
            || streaming.overall_timeout_ms == 0
            || streaming.heartbeat_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "streaming timers must be greater than zero".into(),
            ));
        }
        if streaming.replay_delay_min_ms > streaming.replay_delay_max_ms {
            return Err(ConfigError::ValidationError(
                "replay_delay_min_ms must not exceed replay_delay_max_ms".into(),
            ));
        }

        if self.history.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "history.max_turns must be at least 1".into(),
            ));
        }
        if self.agent.max_tool_rounds == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_tool_rounds must be at least 1".into(),
            ));
        }
        let factor = self.agent.retry.backoff_factor;
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::ValidationError(
                "agent.retry.backoff_factor must be a finite number >= 1.0".into(),
            ));
        }

        self.business.validate()
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    /// The shared gateway credential, if a non-blank one is configured.
    pub fn bot_token(&self) -> Option<&str> {
        self.gateway
            .bot_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// The model to request from the provider.
    pub fn model(&self) -> String {
        resolve_model(&self.default_model)
    }

    /// Generate a default config TOML string (for `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl BusinessConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let company = &self.company;
        if company.name.trim().is_empty() || company.currency.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "business.company name and currency are required".into(),
            ));
        }
        if company.service_areas.iter().all(|a| a.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "business.company.service_areas must list at least one area".into(),
            ));
        }
        company.hours.for_day(false)?;
        company.hours.for_day(true)?;

        let p = &self.pricing;
        let amounts = [
            p.base_visit_fee,
            p.per_room,
            p.per_bath,
            p.per_sqm,
            self.addons.inside_oven,
            self.addons.inside_fridge,
            self.addons.windows_per_room,
        ];
        if amounts.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(ConfigError::ValidationError(
                "business pricing amounts must be non-negative".into(),
            ));
        }
        let f = &p.frequency_discounts;
        let multipliers = [p.deep_clean_multiplier, f.one_time, f.weekly, f.biweekly, f.monthly];
        if multipliers.iter().any(|v| !v.is_finite() || *v <= 0.0) {
            return Err(ConfigError::ValidationError(
                "business pricing multipliers must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            gateway: GatewayConfig::default(),
            streaming: StreamingConfig::default(),
            history: HistoryConfig::default(),
            agent: AgentConfig::default(),
            business: BusinessConfig::default(),
        }
    }
}

/// Normalize a configured model name.
///
/// Blank names, names with characters outside `[A-Za-z0-9:._-]`, and
/// doubled prefixes such as `gpt-gpt-4o` resolve to [`FALLBACK_MODEL`].
pub fn resolve_model(candidate: &str) -> String {
    let name = candidate.trim();
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-');
    if name.is_empty() || !name.chars().all(allowed) || name.to_ascii_lowercase().contains("gpt-gpt") {
        return FALLBACK_MODEL.to_string();
    }
    name.to_string()
}

/// Parse an `HH:MM-HH:MM` range into minutes since midnight.
///
/// The end must come after the start.
pub fn parse_hours(range: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = || ConfigError::ValidationError(format!("Invalid opening hours: {range}"));

    let (start, end) = range.split_once('-').ok_or_else(invalid)?;
    let start = parse_clock(start).ok_or_else(invalid)?;
    let end = parse_clock(end).ok_or_else(invalid)?;
    if end <= start {
        return Err(ConfigError::ValidationError(format!(
            "End time must be after start time in range: {range}"
        )));
    }
    Ok((start, end))
}

fn parse_clock(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 || !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (h, m): (u32, u32) = (h.parse().ok()?, m.parse().ok()?);
    (h <= 24 && m < 60).then_some(h * 60 + m)
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
