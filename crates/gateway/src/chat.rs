//! Conversational routes: `/chat`, `/chat/abort` and `/session/reset`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Mutex;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use concierge_agent::{AbortReason, AbortSignal, ChatTurn, EVENT_BUFFER, EventSink};
use concierge_core::session::SessionKey;

use crate::{ApiError, SharedState, header_value};

pub const CLIENT_ID_HEADER: &str = "x-client-id";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const BOT_TOKEN_HEADER: &str = "x-bot-token";
pub const SESSION_COOKIE: &str = "session_id";

// --- Caller identity ---

/// Who is talking, resolved from headers and the session cookie.
#[derive(Debug, Clone)]
pub struct Caller {
    pub key: SessionKey,
    /// Set when no session id was supplied and one was generated.
    issued_session: Option<String>,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Caller {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let client_id = header_str(headers, CLIENT_ID_HEADER).ok_or_else(|| {
            ApiError::bad_request("MISSING_CLIENT_ID", "The x-client-id header is required.")
        })?;
        let tenant_id = header_str(headers, TENANT_ID_HEADER).ok_or_else(|| {
            ApiError::bad_request("MISSING_TENANT_ID", "The x-tenant-id header is required.")
        })?;

        let (session_id, issued_session) =
            match header_str(headers, SESSION_ID_HEADER).or_else(|| session_cookie(headers)) {
                Some(id) => (id, None),
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    (id.clone(), Some(id))
                }
            };

        Ok(Self {
            key: SessionKey::new(tenant_id, session_id, client_id),
            issued_session,
        })
    }

    /// Attach a `Set-Cookie` for a freshly issued session id.
    fn set_cookie(&self, response: &mut Response) {
        let cookie = self
            .issued_session
            .as_ref()
            .map(|id| format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax"))
            .and_then(|c| header_value(&c));
        if let Some(cookie) = cookie {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }
}

// --- In-flight streams ---

/// Abort signals of running streams, one per session key.
#[derive(Debug, Default)]
pub struct InFlight {
    streams: Mutex<HashMap<SessionKey, (String, AbortSignal)>>,
}

impl InFlight {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, (String, AbortSignal)>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, key: &SessionKey, request_id: &str, signal: AbortSignal) {
        self.lock()
            .insert(key.clone(), (request_id.to_string(), signal));
    }

    /// Forget a finished stream, unless a newer one took its place.
    pub fn finish(&self, key: &SessionKey, request_id: &str) {
        let mut streams = self.lock();
        if streams.get(key).is_some_and(|(rid, _)| rid == request_id) {
            streams.remove(key);
        }
    }

    /// Raise the abort signal of the key's stream. `false` if there was none
    /// or it was already aborted.
    pub fn abort(&self, key: &SessionKey, reason: AbortReason) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|(_, signal)| signal.abort(reason))
    }
}

// --- /chat ---

#[derive(Debug, Default, Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReplyBody {
    reply: String,
}

fn wants_json(headers: &HeaderMap) -> bool {
    let stream_mode = header_str(headers, "x-stream-mode");
    let accept = header_str(headers, header::ACCEPT.as_str()).unwrap_or_default();
    stream_mode.is_some_and(|m| m.eq_ignore_ascii_case("json")) || accept.contains("application/json")
}

fn read_body<T: Default>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "PAYLOAD_TOO_LARGE",
            rejection.body_text(),
        )),
        Err(_) => Ok(T::default()),
    }
}

/// `POST /chat`
pub async fn chat_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let message = read_body(body)?
        .message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::bad_request("MISSING_MESSAGE", "A non-empty message is required."))?;
    let caller = Caller::from_headers(&headers)?;

    let turn = ChatTurn::new(caller.key.clone(), message);
    let json_mode = wants_json(&headers) || !state.config.streaming.enabled;
    info!(
        request_id = %turn.request_id,
        session = %caller.key,
        chars = turn.message.len(),
        mode = if json_mode { "json" } else { "sse" },
        "Chat request"
    );

    let mut response = if json_mode {
        let reply = state.delivery.reply_once(&turn).await?;
        Json(ReplyBody { reply }).into_response()
    } else {
        stream_reply(&state, turn)
    };
    caller.set_cookie(&mut response);
    Ok(response)
}

/// Spawn the delivery task and frame its events as SSE.
fn stream_reply(state: &SharedState, turn: ChatTurn) -> Response {
    let (sink, rx) = EventSink::channel(EVENT_BUFFER);
    let signal = AbortSignal::new();
    state
        .in_flight
        .register(&turn.key, &turn.request_id, signal.clone());

    let task_state = state.clone();
    tokio::spawn(async move {
        let key = turn.key.clone();
        let request_id = turn.request_id.clone();
        let outcome = task_state.delivery.run(turn, sink, signal).await;
        task_state.in_flight.finish(&key, &request_id);
        debug!(request_id = %request_id, state = ?outcome, "Chat stream finished");
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<_, Infallible>(
            SseEvent::default()
                .event(event.event_type())
                .data(event.payload().to_string()),
        )
    });

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", header::HeaderValue::from_static("no"));
    response
}

// --- /chat/abort ---

#[derive(Debug, Default, Deserialize)]
pub struct AbortBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub ok: bool,
    pub aborted: bool,
}

/// `POST /chat/abort`
pub async fn abort_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Result<Json<AbortBody>, JsonRejection>,
) -> Result<Json<AbortResponse>, ApiError> {
    let caller = Caller::from_headers(&headers)?;
    let reason = match read_body(body)?.reason.as_deref() {
        None | Some("user_abort") => AbortReason::UserAbort,
        Some("client_watchdog") => AbortReason::ClientWatchdog,
        Some(other) => {
            return Err(ApiError::bad_request(
                "INVALID_REASON",
                format!("Unsupported abort reason '{other}'. Use 'user_abort' or 'client_watchdog'."),
            ));
        }
    };

    let aborted = state.in_flight.abort(&caller.key, reason);
    info!(session = %caller.key, reason = %reason, aborted, "Abort requested");
    Ok(Json(AbortResponse { ok: true, aborted }))
}

// --- /session/reset ---

/// `POST /session/reset`
pub async fn reset_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = Caller::from_headers(&headers)?;
    state
        .sessions
        .reset(&caller.key)
        .await
        .map_err(|e| ApiError::server(e.to_string()))?;
    info!(session = %caller.key, "Session reset");
    Ok(Json(serde_json::json!({ "ok": true })))
}
