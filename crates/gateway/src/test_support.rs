//! Router test helpers.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, request};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use concierge_config::AppConfig;
use concierge_core::error::ProviderError;
use concierge_core::event::EventBus;
use concierge_core::message::Message;
use concierge_core::provider::{Provider, ProviderRequest, ProviderResponse};
use concierge_memory::InMemorySessionStore;

use crate::{AppState, SharedState};

/// Always answers with the same text. Streams through the trait's default
/// single-chunk `stream`.
pub struct StubProvider {
    reply: String,
}

impl StubProvider {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse {
            message: Message::assistant(&self.reply),
            usage: None,
            model: "stub-model".into(),
        })
    }
}

/// Bot token configured by [`state_with`] and sent by [`request`].
pub const TEST_BOT_TOKEN: &str = "test-bot-token";

pub fn state_with(configure: impl FnOnce(&mut AppConfig)) -> SharedState {
    state_with_provider(Arc::new(StubProvider::new("Happy to help!")), configure)
}

pub fn state_with_provider(
    provider: Arc<dyn Provider>,
    configure: impl FnOnce(&mut AppConfig),
) -> SharedState {
    let mut config = AppConfig::default();
    config.gateway.bot_token = Some(TEST_BOT_TOKEN.to_string());
    configure(&mut config);
    let events = Arc::new(EventBus::default());
    let tools = Arc::new(concierge_tools::default_registry(
        &config.business,
        events.clone(),
    ));
    Arc::new(AppState::new(
        config,
        provider,
        Arc::new(InMemorySessionStore::new()),
        tools,
        events,
    ))
}

/// A request builder carrying the identity and bot token headers.
pub fn request(method: &str, uri: &str) -> request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-client-id", "client-1")
        .header("x-tenant-id", "acme")
        .header("x-bot-token", TEST_BOT_TOKEN)
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    request(method, uri)
        .header("content-type", "application/json")
        .header("accept", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Send one request; the body is parsed as JSON, or `Null` if it is not JSON.
pub async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}
