//! End-to-end tests for the concierge.
//!
//! These wire the real tool registry, agent loop, chat delivery and HTTP
//! router together, with only the completion provider scripted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use concierge_agent::tool_loop::HANDOFF_ACK;
use concierge_agent::{AgentRequest, LoopOutcome, ToolLoop};
use concierge_config::AppConfig;
use concierge_core::error::ProviderError;
use concierge_core::event::{DomainEvent, EventBus};
use concierge_core::message::{Message, MessageToolCall, Role};
use concierge_core::provider::{Provider, ProviderRequest, ProviderResponse};
use concierge_gateway::{AppState, build_router};
use concierge_memory::InMemorySessionStore;
use concierge_tools::{HandoffInbox, default_registry};

// ── Scripted provider ────────────────────────────────────────────────────

/// Returns queued responses in order and records every request.
#[derive(Default)]
struct ScriptedProvider {
    responses: Mutex<VecDeque<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> ProviderRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 500,
                message: "ScriptedProvider exhausted".into(),
            })
    }
}

fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: None,
        model: "mock".into(),
    }
}

fn tool_response(calls: Vec<MessageToolCall>) -> ProviderResponse {
    let mut message = Message::assistant("");
    message.tool_calls = calls;
    ProviderResponse {
        message,
        usage: None,
        model: "mock".into(),
    }
}

fn call(id: &str, name: &str, args: Value) -> MessageToolCall {
    MessageToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

fn quote_json() -> Value {
    json!({
        "currency": "USD", "total": 144.0, "subtotal": 144.0,
        "breakdown": {
            "baseVisitFee": 40.0, "rooms": 40.0, "baths": 16.0, "squareMeters": 48.0,
            "serviceMultiplier": 1.0, "frequencyMultiplier": 1.0,
            "extras": {"insideOven": 0.0, "insideFridge": 0.0, "windows": 0.0}
        }
    })
}

fn booking_args(address: &str) -> Value {
    json!({
        "customer": {
            "name": "Alex Kim",
            "phone": "+1 415 555 0100",
            "email": "alex@example.com",
            "address": address
        },
        "scheduled_start": "2024-07-15T08:00:00",
        "scheduled_end": "2024-07-15T10:00:00",
        "quote": quote_json()
    })
}

const BOT_TOKEN: &str = "widget-secret";

fn test_config(dir: &tempfile::TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.business.handoff_inbox = dir.path().join("handoffs.json");
    config.gateway.bot_token = Some(BOT_TOKEN.into());
    config
}

fn tool_loop(provider: Arc<ScriptedProvider>, config: &AppConfig, events: Arc<EventBus>) -> ToolLoop {
    let tools = Arc::new(default_registry(&config.business, events.clone()));
    ToolLoop::from_config(provider, tools, config, events)
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Arc<DomainEvent>>) -> Vec<Arc<DomainEvent>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Agent loop ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_quote_booking_payment_flow() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(vec![call(
            "c1",
            "quote_cleaning",
            json!({"rooms": 2, "baths": 1, "square_meters": 80, "service_type": "standard", "frequency": "one_time"}),
        )]),
        tool_response(vec![call(
            "c2",
            "create_booking",
            booking_args("500 Howard St, San Francisco, CA"),
        )]),
        tool_response(vec![call(
            "c3",
            "generate_payment_link",
            json!({"booking_id": "bk-123", "amount": 144.0, "currency": "usd"}),
        )]),
        text_response("You're booked! Here is your payment link."),
    ]));
    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let agent = tool_loop(provider.clone(), &config, events);

    let reply = agent
        .run(AgentRequest::new(vec![Message::user(
            "Book a standard clean for my 2 bedroom flat in San Francisco",
        )]))
        .await
        .expect("agent turn should succeed");

    assert_eq!(reply.outcome, LoopOutcome::Completed);
    assert_eq!(reply.message.content, "You're booked! Here is your payment link.");
    assert_eq!(
        reply.tools_used,
        vec!["quote_cleaning", "create_booking", "generate_payment_link"]
    );
    assert!(reply.handoff.is_none());
    assert_eq!(provider.calls(), 4);

    let quote = &reply.tool_results["quote_cleaning"][0]["result"];
    assert_eq!(quote["currency"], "USD");
    assert!(quote["total"].as_f64().unwrap() > 0.0);

    let booking = &reply.tool_results["create_booking"][0]["booking"];
    assert_eq!(booking["status"], "pending_payment");

    let link = &reply.tool_results["generate_payment_link"][0]["paymentLink"];
    assert_eq!(link["currency"], "USD");
    assert_eq!(link["bookingId"], "bk-123");

    // Every round after the first sees the previous tool result.
    let last = provider.request(3);
    let tool_messages: Vec<&Message> = last
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 3);
    for message in &tool_messages {
        let content: Value = serde_json::from_str(&message.content).unwrap();
        assert_eq!(content["ok"], true);
    }
    assert_eq!(last.tools.len(), 7);

    let published = drain(&mut rx);
    let count = |pred: fn(&DomainEvent) -> bool| published.iter().filter(|e| pred(e)).count();
    assert_eq!(count(|e| matches!(e, DomainEvent::QuoteIssued { .. })), 1);
    assert_eq!(count(|e| matches!(e, DomainEvent::BookingCreated { .. })), 1);
    assert_eq!(count(|e| matches!(e, DomainEvent::PaymentLinkGenerated { .. })), 1);
    assert_eq!(
        count(|e| matches!(e, DomainEvent::ToolExecuted { success: true, attempts: 1, .. })),
        3
    );
}

#[tokio::test]
async fn e2e_escalation_short_circuits_and_records_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(vec![call(
            "c1",
            "escalate_to_human",
            json!({
                "reason": "customer wants to discuss a damaged rug",
                "contact": {"name": "Sam", "phone": "+1 510 555 0199", "preferred_contact_method": "phone"}
            }),
        )]),
        text_response("this must never be requested"),
    ]));
    let events = Arc::new(EventBus::default());
    let agent = tool_loop(provider.clone(), &config, events);

    let mut metadata = serde_json::Map::new();
    metadata.insert("channel".into(), json!("web"));
    let request = AgentRequest {
        messages: vec![
            Message::system("client supplied system prompt"),
            Message::user("Your cleaner damaged my rug, I want to talk to someone"),
        ],
        metadata,
    };

    let reply = agent.run(request).await.expect("agent turn should succeed");

    assert_eq!(reply.outcome, LoopOutcome::HandedOff);
    assert_eq!(reply.message.content, HANDOFF_ACK);
    assert_eq!(provider.calls(), 1);

    let handoff = reply.handoff.expect("handoff id");
    let inbox = HandoffInbox::new(&config.business.handoff_inbox);
    let records = inbox.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, handoff.handoff_id);
    assert_eq!(records[0].metadata.get("channel"), Some(&json!("web")));
    assert!(
        records[0]
            .conversation
            .iter()
            .all(|entry| entry.role != Role::System)
    );
}

#[tokio::test(start_paused = true)]
async fn e2e_tool_failures_do_not_abort_the_turn() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(vec![
            call("c1", "create_booking", booking_args("1 Main St, Sacramento, CA")),
            call("c2", "no_such_tool", json!({})),
            call("c3", "faq_lookup", json!({"question": "What is your cancellation policy?"})),
        ]),
        text_response("Sorry, we don't serve Sacramento yet."),
    ]));
    let events = Arc::new(EventBus::default());
    let mut rx = events.subscribe();
    let agent = tool_loop(provider.clone(), &config, events);

    let reply = agent
        .run(AgentRequest::new(vec![Message::user("Book me in Sacramento")]))
        .await
        .expect("tool failures are not errors");

    assert_eq!(reply.outcome, LoopOutcome::Completed);
    assert_eq!(reply.tools_used, vec!["faq_lookup"]);
    assert!(!reply.tool_results.contains_key("create_booking"));

    let transcript = provider.request(1).messages;
    let results: Vec<Value> = transcript
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| serde_json::from_str(&m.content).unwrap())
        .collect();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["ok"], false);
    assert!(results[0]["error"].as_str().unwrap().contains("service areas"));
    assert_eq!(results[1]["ok"], false);
    assert!(results[1]["error"].as_str().unwrap().contains("no_such_tool"));
    assert_eq!(results[2]["ok"], true);

    // The out-of-area booking is retried under the default policy.
    let booking_attempts = drain(&mut rx).iter().find_map(|e| match e.as_ref() {
        DomainEvent::ToolExecuted {
            tool_name,
            attempts,
            success: false,
            ..
        } if tool_name == "create_booking" => Some(*attempts),
        _ => None,
    });
    assert_eq!(booking_attempts, Some(3));
}

// ── HTTP surface ─────────────────────────────────────────────────────────

fn app(provider: Arc<ScriptedProvider>, config: AppConfig) -> (axum::Router, Arc<AppState>) {
    let events = Arc::new(EventBus::default());
    let tools = Arc::new(default_registry(&config.business, events.clone()));
    let state = Arc::new(AppState::new(
        config,
        provider,
        Arc::new(InMemorySessionStore::new()),
        tools,
        events,
    ));
    (build_router(state.clone()), state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn e2e_chat_history_flows_between_turns() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        text_response("Hi! How can I help?"),
        text_response("A standard clean starts at 40 USD."),
    ]));
    let (router, _) = app(provider.clone(), test_config(&dir));

    let chat = |message: &str| {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header("x-bot-token", BOT_TOKEN)
            .header("x-client-id", "widget-7")
            .header("x-tenant-id", "bright-home")
            .header("x-session-id", "abc")
            .header("x-stream-mode", "json")
            .header("content-type", "application/json")
            .body(Body::from(json!({"message": message}).to_string()))
            .unwrap()
    };

    let first = router.clone().oneshot(chat("Hello")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(body_json(first).await["reply"], "Hi! How can I help?");

    let second = router.clone().oneshot(chat("How much is it?")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let request = provider.request(1);
    let turns: Vec<(Role, &str)> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        turns,
        vec![
            (Role::User, "Hello"),
            (Role::Assistant, "Hi! How can I help?"),
            (Role::User, "How much is it?"),
        ]
    );
}

#[tokio::test]
async fn e2e_agent_endpoint_runs_tools() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_response(vec![call(
            "c1",
            "check_availability",
            json!({"date": "2024-07-15"}),
        )]),
        text_response("We have morning and afternoon slots on Monday."),
    ]));
    let (router, _) = app(provider.clone(), test_config(&dir));

    let request = Request::builder()
        .method("POST")
        .uri("/agent/chat")
        .header("x-bot-token", BOT_TOKEN)
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"messages": [{"role": "user", "content": "Any slots on July 15?"}]}).to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["message"]["content"], "We have morning and afternoon slots on Monday.");
    assert_eq!(body["tools_used"], json!(["check_availability"]));
    assert!(body["tool_results"]["check_availability"][0].is_object());
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn e2e_provider_failure_is_normalized() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::default());
    let (router, state) = app(provider, test_config(&dir));

    let request = Request::builder()
        .method("POST")
        .uri("/chat")
        .header("x-bot-token", BOT_TOKEN)
        .header("x-client-id", "widget-7")
        .header("x-tenant-id", "bright-home")
        .header("accept", "application/json")
        .header("content-type", "application/json")
        .body(Body::from(json!({"message": "hello"}).to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body["error"], "PROVIDER_ERROR");
    assert_eq!(body["status"], 500);
    assert!(
        state
            .diagnostics
            .markers()
            .iter()
            .any(|m| m.kind.as_str() == "sse_error")
    );
}
