//! Agent, catalog and operational routes.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::response::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use concierge_agent::{AgentReply, AgentRequest, Marker};
use concierge_tools::CATALOG_VERSION;

use crate::{ApiError, SharedState};

/// Whether any string inside `value` contains one of `terms`, ignoring case.
pub fn contains_banned(value: &Value, terms: &[String]) -> bool {
    match value {
        Value::String(s) => {
            let lower = s.to_lowercase();
            terms
                .iter()
                .any(|t| !t.is_empty() && lower.contains(&t.to_lowercase()))
        }
        Value::Array(items) => items.iter().any(|v| contains_banned(v, terms)),
        Value::Object(map) => map.values().any(|v| contains_banned(v, terms)),
        _ => false,
    }
}

/// `POST /agent/chat`
pub async fn agent_chat_handler(
    State(state): State<SharedState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<AgentReply>, ApiError> {
    let Json(body) = body.map_err(|r| ApiError::new(r.status(), "INVALID_BODY", r.body_text()))?;

    let messages = body.get("messages").filter(|m| m.is_array()).ok_or_else(|| {
        ApiError::bad_request("INVALID_MESSAGES", "messages must be an array")
    })?;
    if contains_banned(messages, &state.config.gateway.banned_terms) {
        warn!("Agent request rejected for prohibited language");
        return Err(ApiError::bad_request(
            "PROHIBITED_LANGUAGE",
            "Message contains prohibited language.",
        ));
    }

    let request: AgentRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request("INVALID_MESSAGES", e.to_string()))?;
    info!(messages = request.messages.len(), "Agent chat request");

    let reply = state.agent.run(request).await?;
    info!(
        outcome = ?reply.outcome,
        rounds = reply.rounds,
        tools = ?reply.tools_used,
        "Agent chat reply"
    );
    Ok(Json(reply))
}

#[derive(Debug, Serialize)]
pub struct ToolDto {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub version: &'static str,
    pub tools: Vec<ToolDto>,
    pub count: usize,
}

/// `GET /tools`
pub async fn tools_handler(State(state): State<SharedState>) -> Json<CatalogResponse> {
    let tools: Vec<ToolDto> = state
        .agent
        .tools()
        .definitions()
        .into_iter()
        .map(|d| ToolDto {
            name: d.name,
            description: d.description,
            parameters: d.parameters,
        })
        .collect();

    Json(CatalogResponse {
        version: CATALOG_VERSION,
        count: tools.len(),
        tools,
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub has_api_key: bool,
    pub model: String,
    pub streaming_enabled: bool,
    pub last_request_id: Option<String>,
    pub last_reason: Option<String>,
}

/// `GET /health`
pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let last = state.diagnostics.last_failure();
    Json(HealthResponse {
        status: "ok",
        has_api_key: state.config.has_api_key(),
        model: state.config.model(),
        streaming_enabled: state.config.streaming.enabled,
        last_request_id: last.request_id,
        last_reason: last.reason,
    })
}

#[derive(Debug, Serialize)]
pub struct DiagResponse {
    pub markers: Vec<Marker>,
}

/// `GET /diag/last`
pub async fn diag_handler(State(state): State<SharedState>) -> Json<DiagResponse> {
    Json(DiagResponse {
        markers: state.diagnostics.markers(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_router;
    use crate::test_support::{json_request, request, send, state_with};
    use axum::body::Body;
    use axum::http::StatusCode;
    use concierge_agent::MarkerKind;
    use serde_json::json;

    #[test]
    fn banned_terms_are_found_anywhere() {
        let terms = vec!["darn".to_string()];
        assert!(contains_banned(&json!([{"content": "Well DARN it"}]), &terms));
        assert!(contains_banned(&json!({"a": {"b": ["x", "darned"]}}), &terms));
        assert!(!contains_banned(&json!([{"content": "hello", "n": 3}]), &terms));
    }

    #[tokio::test]
    async fn catalog_lists_versioned_tools() {
        let app = build_router(state_with(|_| {}));
        let (status, body) = send(&app, request("GET", "/tools").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "2024-07");
        assert_eq!(body["count"], 7);
        let names: Vec<&str> = body["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for expected in [
            "quote_cleaning",
            "check_availability",
            "create_booking",
            "generate_payment_link",
            "save_lead",
            "faq_lookup",
            "escalate_to_human",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert!(body["tools"][0]["parameters"].is_object());
    }

    #[tokio::test]
    async fn health_reports_config_and_last_failure() {
        let state = state_with(|c| c.api_key = Some("sk-test".into()));
        state
            .diagnostics
            .record(MarkerKind::FallbackUsed, "feedbeef", Some("overall_timeout"));
        let app = build_router(state);

        let (status, body) = send(&app, request("GET", "/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["has_api_key"], true);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["streaming_enabled"], true);
        assert_eq!(body["last_request_id"], "feedbeef");
        assert_eq!(body["last_reason"], "overall_timeout");
    }

    #[tokio::test]
    async fn diag_route_is_opt_in() {
        let app = build_router(state_with(|_| {}));
        let (status, _) = send(&app, request("GET", "/diag/last").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let state = state_with(|c| c.gateway.diagnostics = true);
        state.diagnostics.record(MarkerKind::SseStart, "r1", None);
        let app = build_router(state);
        let (status, body) = send(&app, request("GET", "/diag/last").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["markers"][0]["kind"], "sse_start");
        assert_eq!(body["markers"][0]["request_id"], "r1");
    }

    #[tokio::test]
    async fn agent_chat_rejects_banned_language() {
        let app = build_router(state_with(|_| {}));
        let body = json!({"messages": [{"role": "user", "content": "this is shit"}]});
        let (status, body) = send(&app, json_request("POST", "/agent/chat", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "PROHIBITED_LANGUAGE");
    }

    #[tokio::test]
    async fn agent_chat_requires_message_array() {
        let app = build_router(state_with(|_| {}));
        let (status, body) =
            send(&app, json_request("POST", "/agent/chat", json!({"messages": "hi"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_MESSAGES");
    }

    #[tokio::test]
    async fn agent_chat_returns_reply_shape() {
        let app = build_router(state_with(|_| {}));
        let body = json!({
            "messages": [{"role": "user", "content": "What do you offer?"}],
            "metadata": {"channel": "web"}
        });
        let (status, body) = send(&app, json_request("POST", "/agent/chat", body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["role"], "assistant");
        assert_eq!(body["message"]["content"], "Happy to help!");
        assert_eq!(body["tools_used"], json!([]));
        assert_eq!(body["tool_results"], json!({}));
        assert!(body["handoff"].is_null());
        assert_eq!(body["outcome"], "completed");
    }
}
