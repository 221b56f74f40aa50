//! OpenAI-compatible chat completions provider.
//!
//! Speaks `/chat/completions` in both modes:
//! - non-streaming, used by the tool loop and the fallback path
//! - SSE streaming, decoded into [`StreamChunk`]s by a background reader task
//!
//! The reader task stops as soon as the receiving side is dropped, so
//! cancelling a delivery never leaves a socket being drained.

use async_trait::async_trait;
use concierge_config::AppConfig;
use concierge_core::error::ProviderError;
use concierge_core::message::{Message, MessageToolCall, Role};
use concierge_core::provider::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible completion provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a provider for any endpoint exposing `/chat/completions`.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// The OpenAI endpoint.
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Build from application config. A missing key is reported per request
    /// as [`ProviderError::NotConfigured`].
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            "openai",
            config.api_url.clone(),
            config.api_key.clone().unwrap_or_default(),
        )
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn ensure_configured(&self) -> Result<(), ProviderError> {
        if self.has_api_key() {
            Ok(())
        } else {
            Err(ProviderError::NotConfigured(
                "no completion API key is configured".into(),
            ))
        }
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }
        body
    }

    async fn post(
        &self,
        body: &serde_json::Value,
        accept: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", accept)
            .json(body)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status().as_u16();
        match status {
            200 => Ok(response),
            429 => Err(ProviderError::RateLimited {
                retry_after_secs: retry_after(&response).unwrap_or(5),
            }),
            401 | 403 => Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            )),
            404 => Err(ProviderError::ModelNotFound(
                body["model"].as_str().unwrap_or_default().to_string(),
            )),
            _ => {
                let error_body = response.text().await.unwrap_or_default();
                warn!(provider = %self.name, status, body = %error_body, "Provider returned error");
                Err(ProviderError::ApiError {
                    status_code: status,
                    message: error_body,
                })
            }
        }
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| {
                let tool_calls: Vec<ApiToolCall> = m
                    .tool_calls
                    .iter()
                    .map(|tc| ApiToolCall {
                        id: tc.id.clone(),
                        r#type: "function".into(),
                        function: ApiFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect();

                // assistant tool-call turns carry null content
                let content = if m.content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(m.content.clone())
                };

                ApiMessage {
                    role: role_name(m.role).into(),
                    content,
                    name: m.name.clone(),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: m.tool_call_id.clone(),
                }
            })
            .collect()
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

fn send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

fn retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        self.ensure_configured()?;
        let body = Self::request_body(&request, false);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");
        let response = self.post(&body, "application/json").await?;

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let mut message = Message::assistant(choice.message.content.unwrap_or_default());
        message.tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| MessageToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        Ok(ProviderResponse {
            message,
            usage: api_response.usage.map(Usage::from),
            model: api_response.model,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        self.ensure_configured()?;
        let mut body = Self::request_body(&request, true);
        body["stream_options"] = serde_json::json!({ "include_usage": true });

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");
        let response = self.post(&body, "text/event-stream").await?;

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        trace!(provider = %provider_name, "Stream receiver dropped, stopping reader");
                        return;
                    }
                    next = bytes.next() => next,
                };

                let Some(result) = next else { break };
                let data = match result {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };

                for chunk in decoder.feed(&data) {
                    let done = chunk.done;
                    if tx.send(Ok(chunk)).await.is_err() || done {
                        return;
                    }
                }
            }

            // body ended without [DONE]
            let _ = tx.send(Ok(decoder.finish())).await;
        });

        Ok(rx)
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        self.ensure_configured()?;
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(send_error)?;

        Ok(response.status().is_success())
    }
}

/// Incremental decoder for an OpenAI SSE body.
///
/// Bytes may split lines (and UTF-8 sequences) anywhere; only complete lines
/// are interpreted. Tool-call fragments are merged by index and released
/// with the terminal chunk.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finished: bool,
}

impl SseDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            if self.finished {
                break;
            }
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                out.push(self.finish());
                break;
            }

            match serde_json::from_str::<StreamResponse>(data) {
                Ok(resp) => {
                    if let Some(chunk) = self.apply(resp) {
                        let done = chunk.done;
                        out.push(chunk);
                        if done {
                            break;
                        }
                    }
                }
                Err(e) => trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk"),
            }
        }
        out
    }

    fn apply(&mut self, resp: StreamResponse) -> Option<StreamChunk> {
        let mut content = None;
        if let Some(choice) = resp.choices.into_iter().next() {
            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let acc = self.tool_calls.entry(delta.index).or_default();
                if let Some(id) = delta.id {
                    acc.id = id;
                }
                if let Some(func) = delta.function {
                    if let Some(name) = func.name {
                        acc.name = name;
                    }
                    if let Some(args) = func.arguments {
                        acc.arguments.push_str(&args);
                    }
                }
            }
            content = choice.delta.content.filter(|c| !c.is_empty());
        }

        // include_usage puts usage on a trailing chunk with no choices
        if let Some(usage) = resp.usage {
            let mut last = self.finish();
            last.content = content;
            last.usage = Some(usage.into());
            return Some(last);
        }
        content.map(StreamChunk::token)
    }

    fn finish(&mut self) -> StreamChunk {
        self.finished = true;
        StreamChunk {
            tool_calls: std::mem::take(&mut self.tool_calls)
                .into_values()
                .map(ToolCallAccumulator::into_tool_call)
                .collect(),
            ..StreamChunk::done()
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_tool_call(self) -> MessageToolCall {
        MessageToolCall {
            id: self.id,
            name: self.name,
            arguments: self.arguments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(chunks: &[StreamChunk]) -> Vec<&str> {
        chunks.iter().filter_map(|c| c.content.as_deref()).collect()
    }

    #[test]
    fn config_constructor() {
        let mut config = AppConfig::default();
        config.api_url = "http://localhost:8080/v1/".into();
        let provider = OpenAiCompatProvider::from_config(&config);
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.base_url, "http://localhost:8080/v1");
        assert!(!provider.has_api_key());
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let provider = OpenAiCompatProvider::openai("");
        let err = provider
            .complete(ProviderRequest::new("gpt-4o-mini", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));

        let err = provider
            .stream(ProviderRequest::new("gpt-4o-mini", vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[test]
    fn message_conversion() {
        let mut user = Message::user("Do you clean ovens?");
        user.name = Some("alex".into());
        let api = OpenAiCompatProvider::to_api_messages(&[Message::system("Be brief"), user]);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
        assert_eq!(api[1].name.as_deref(), Some("alex"));
    }

    #[test]
    fn assistant_tool_call_has_null_content() {
        let mut msg = Message::assistant("");
        msg.tool_calls = vec![MessageToolCall {
            id: "call_1".into(),
            name: "quote_cleaning".into(),
            arguments: r#"{"rooms":2}"#.into(),
        }];
        let api = OpenAiCompatProvider::to_api_messages(&[msg, Message::tool_result("call_1", "{}")]);

        assert!(api[0].content.is_none());
        let tc = api[0].tool_calls.as_ref().unwrap();
        assert_eq!(tc[0].function.name, "quote_cleaning");
        assert_eq!(api[1].role, "tool");
        assert_eq!(api[1].tool_call_id.as_deref(), Some("call_1"));

        let json = serde_json::to_value(&api[0]).unwrap();
        assert!(json["content"].is_null());
    }

    #[test]
    fn request_body_includes_tools() {
        let request = ProviderRequest::new("gpt-4o-mini", vec![Message::user("hi")]).with_tools(vec![
            ToolDefinition {
                name: "faq_lookup".into(),
                description: "Answer FAQs".into(),
                parameters: serde_json::json!({"type": "object"}),
            },
        ]);
        let body = OpenAiCompatProvider::request_body(&request, false);
        assert_eq!(body["stream"], false);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "faq_lookup");
    }

    #[test]
    fn parse_completion_response() {
        let data = r#"{
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": null,
                "tool_calls": [{"id": "call_q", "type": "function",
                    "function": {"name": "quote_cleaning", "arguments": "{}"}}]}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let parsed: ApiResponse = serde_json::from_str(data).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
        assert_eq!(parsed.choices[0].message.tool_calls.as_ref().unwrap()[0].id, "call_q");
        assert_eq!(parsed.usage.unwrap().total_tokens, 15);
    }

    // --- SSE decoding ---

    #[test]
    fn decoder_emits_tokens_and_done() {
        let mut decoder = SseDecoder::default();
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"We \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"clean ovens.\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let chunks = decoder.feed(body.as_bytes());
        assert_eq!(contents(&chunks), vec!["We ", "clean ovens."]);
        assert!(chunks.last().unwrap().done);
    }

    #[test]
    fn decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        let first = decoder.feed(b"data: {\"choices\":[{\"delta\":{\"con");
        assert!(first.is_empty());
        let second = decoder.feed(b"tent\":\"Hello\"}}]}\r\n\r\n");
        assert_eq!(contents(&second), vec!["Hello"]);
    }

    #[test]
    fn decoder_skips_comments_and_garbage() {
        let mut decoder = SseDecoder::default();
        let chunks = decoder.feed(b": keep-alive\n\ndata: not-json\n\nevent: ping\n\n");
        assert!(chunks.is_empty());
    }

    #[test]
    fn decoder_merges_tool_call_fragments() {
        let mut decoder = SseDecoder::default();
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"check_availability\",\"arguments\":\"\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"date\\\":\"}}]}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"2024-07-15\\\"}\"}}]}}]}\n",
            "data: [DONE]\n",
        );
        let chunks = decoder.feed(body.as_bytes());
        assert_eq!(chunks.len(), 1);
        let done = &chunks[0];
        assert!(done.done);
        assert_eq!(done.tool_calls[0].id, "call_a");
        assert_eq!(done.tool_calls[0].name, "check_availability");
        assert_eq!(done.tool_calls[0].arguments, r#"{"date":"2024-07-15"}"#);
    }

    #[test]
    fn decoder_usage_chunk_terminates() {
        let mut decoder = SseDecoder::default();
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":\"stop\"}]}\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":1,\"total_tokens\":11}}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
        );
        let chunks = decoder.feed(body.as_bytes());
        assert_eq!(contents(&chunks), vec!["Hi"]);
        let last = chunks.last().unwrap();
        assert!(last.done);
        assert_eq!(last.usage.as_ref().unwrap().total_tokens, 11);
    }

    #[test]
    fn decoder_finish_without_done_marker() {
        let mut decoder = SseDecoder::default();
        decoder.feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n");
        let last = decoder.finish();
        assert!(last.done);
        assert!(last.content.is_none());
    }
}
