//! HTTP gateway for the cleaning concierge.
//!
//! Routes:
//!
//! - `POST /chat`            conversational reply, SSE or JSON
//! - `POST /chat/abort`      cancel the caller's in-flight stream
//! - `POST /session/reset`   clear the caller's history
//! - `POST /agent/chat`      tool-calling agent turn
//! - `GET  /tools`           versioned tool catalog
//! - `GET  /health`          liveness plus last delivery failure
//! - `GET  /diag/last`       recent delivery markers (opt-in)
//!
//! Built on Axum.

pub mod api;
pub mod chat;

#[cfg(test)]
mod test_support;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use concierge_agent::{ChatDelivery, Diagnostics, ToolLoop};
use concierge_config::AppConfig;
use concierge_core::error::ChatError;
use concierge_core::event::EventBus;
use concierge_core::provider::Provider;
use concierge_core::session::SessionStore;
use concierge_core::tool::ToolRegistry;
use concierge_memory::InMemorySessionStore;
use concierge_providers::OpenAiCompatProvider;

use crate::chat::InFlight;

/// Request bodies above this size are rejected.
pub const BODY_LIMIT: usize = 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub delivery: Arc<ChatDelivery>,
    pub agent: Arc<ToolLoop>,
    pub sessions: Arc<dyn SessionStore>,
    pub diagnostics: Arc<Diagnostics>,
    pub events: Arc<EventBus>,
    pub(crate) in_flight: InFlight,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        config: AppConfig,
        provider: Arc<dyn Provider>,
        sessions: Arc<dyn SessionStore>,
        tools: Arc<ToolRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        let diagnostics = Arc::new(Diagnostics::new());
        let delivery = ChatDelivery::from_config(provider.clone(), sessions.clone(), &config)
            .with_diagnostics(diagnostics.clone())
            .with_events(events.clone());
        let agent = ToolLoop::from_config(provider, tools, &config, events.clone());

        Self {
            config,
            delivery: Arc::new(delivery),
            agent: Arc::new(agent),
            sessions,
            diagnostics,
            events,
            in_flight: InFlight::default(),
        }
    }

    /// Wire the production provider, an in-memory session store and the
    /// default tool registry.
    pub fn from_config(config: AppConfig) -> Self {
        let provider: Arc<dyn Provider> = Arc::new(OpenAiCompatProvider::from_config(&config));
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let events = Arc::new(EventBus::default());
        let tools = Arc::new(concierge_tools::default_registry(
            &config.business,
            events.clone(),
        ));
        Self::new(config, provider, sessions, tools, events)
    }
}

// --- Errors ---

/// Error body returned by every route: `{status, error, details, reason?}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiError {
    pub status: u16,
    pub error: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: &str, details: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            error: error.to_string(),
            details: details.into(),
            reason: None,
        }
    }

    pub fn bad_request(error: &str, details: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, details)
    }

    pub fn server(details: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "SERVER_ERROR", details)
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self {
            status: err.status,
            error: err.error.code().to_string(),
            details: err.details,
            reason: err.reason,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

// --- Router ---

/// Build the router with all routes and guards.
///
/// Layers, outermost first: trace, CORS, body limit (1 MB), per-client rate
/// limit, bot token check. `/health` skips the last two.
pub fn build_router(state: SharedState) -> Router {
    let mut router = Router::new()
        .route("/health", get(api::health_handler))
        .route("/tools", get(api::tools_handler))
        .route("/chat", post(chat::chat_handler))
        .route("/chat/abort", post(chat::abort_handler))
        .route("/session/reset", post(chat::reset_handler))
        .route("/agent/chat", post(api::agent_chat_handler));

    if state.config.gateway.diagnostics {
        router = router.route("/diag/last", get(api::diag_handler));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    let per_minute = state.config.gateway.rate_limit_per_minute as usize;
    let rate_limiter =
        (per_minute > 0).then(|| Arc::new(RateLimiter::new(per_minute, Duration::from_secs(60))));

    router
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn(move |req, next| {
            let limiter = rate_limiter.clone();
            rate_limit_middleware(limiter, req, next)
        }))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.bot_token().is_none() {
        return Err("No bot token configured. Set CONCIERGE_BOT_TOKEN or gateway.bot_token; \
                    every chat route requires x-bot-token."
            .into());
    }
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    if !config.has_api_key() {
        warn!("No API key configured; chat requests will fail with MISSING_CREDENTIAL");
    }

    let state = Arc::new(AppState::from_config(config));
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Rate Limiter ---

/// In-memory sliding-window rate limiter keyed by client id.
struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clients: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the request is allowed.
    fn check(&self, client_key: &str) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        if clients.len() > 10_000 {
            clients.retain(|_, timestamps| {
                timestamps
                    .last()
                    .is_some_and(|t| now.duration_since(*t) < self.window)
            });
        }

        let timestamps = clients.entry(client_key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.max_requests {
            return false;
        }

        timestamps.push(now);
        true
    }
}

fn is_exempt(req: &axum::extract::Request) -> bool {
    req.uri().path() == "/health" || req.method() == Method::OPTIONS
}

/// Rejects with 429 once a client exceeds its per-minute budget. Clients are
/// told apart by `x-client-id`.
async fn rate_limit_middleware(
    limiter: Option<Arc<RateLimiter>>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(limiter) = limiter.filter(|_| !is_exempt(&req)) else {
        return next.run(req).await;
    };

    let client_key = req
        .headers()
        .get(chat::CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("anonymous")
        .to_string();

    if !limiter.check(&client_key) {
        warn!(client = %client_key.chars().take(40).collect::<String>(), "Rate limit exceeded");
        return ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Too many requests. Please slow down.",
        )
        .into_response();
    }

    next.run(req).await
}

/// Requires `x-bot-token` to match the configured token. With no token
/// configured every protected route answers 401.
async fn auth_middleware(
    State(state): State<SharedState>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    if is_exempt(&req) {
        return next.run(req).await;
    }

    let expected = state.config.bot_token();
    let provided = req
        .headers()
        .get(chat::BOT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    let authorized = match (expected, provided) {
        (Some(expected), Some(provided)) => tokens_match(expected, provided),
        _ => false,
    };
    if !authorized {
        warn!(
            path = %req.uri().path(),
            configured = expected.is_some(),
            "Rejected request with missing or invalid bot token"
        );
        return ApiError::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "A valid x-bot-token header is required.",
        )
        .into_response();
    }

    next.run(req).await
}

/// Compares every byte regardless of where the first mismatch is.
fn tokens_match(expected: &str, provided: &str) -> bool {
    let (expected, provided) = (expected.as_bytes(), provided.as_bytes());
    if expected.len() != provided.len() {
        return false;
    }
    expected
        .iter()
        .zip(provided)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

pub(crate) fn header_value(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(value).ok()
}
