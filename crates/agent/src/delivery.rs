//! Streaming delivery of one chat turn.
//!
//! ```text
//! Idle → Started → (Streaming | Fallback) → Done | Aborted | Error
//! ```
//!
//! A turn opens the provider stream and relays tokens as they arrive,
//! under three timers: first token, overall, and heartbeat. A timer firing,
//! a failed or broken stream, or a stream that ends with no text moves the
//! turn to fallback: the stream is dropped and one non-streaming completion
//! is replayed as synthetic tokens. Caller cancellations end the turn
//! without fallback. All timers are locals of [`ChatDelivery::run`] and go
//! away with it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use concierge_config::{AppConfig, StreamingConfig};
use concierge_core::error::{ChatError, ProviderError};
use concierge_core::event::{DomainEvent, EventBus};
use concierge_core::message::Message;
use concierge_core::provider::{ChunkReceiver, Provider, ProviderRequest, StreamChunk};
use concierge_core::session::{SessionKey, SessionStore};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, interval_at, sleep};
use tracing::{debug, info, warn};

use crate::abort::{AbortReason, AbortSignal};
use crate::diagnostics::{Diagnostics, MarkerKind};
use crate::prompt::PromptBuilder;
use crate::stream_event::ChatEvent;

/// Buffered events per turn before the writer waits on the caller.
pub const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Idle,
    Started,
    Streaming,
    Fallback,
    Done,
    Aborted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryTiming {
    pub first_token_timeout: Duration,
    pub overall_timeout: Duration,
    pub heartbeat: Duration,
    pub replay_delay_min: Duration,
    pub replay_delay_max: Duration,
}

impl Default for DeliveryTiming {
    fn default() -> Self {
        Self::from(&StreamingConfig::default())
    }
}

impl From<&StreamingConfig> for DeliveryTiming {
    fn from(config: &StreamingConfig) -> Self {
        let (replay_delay_min, replay_delay_max) = config.replay_delay();
        Self {
            first_token_timeout: config.first_token_timeout(),
            overall_timeout: config.overall_timeout(),
            heartbeat: config.heartbeat_interval(),
            replay_delay_min,
            replay_delay_max,
        }
    }
}

impl DeliveryTiming {
    fn replay_gap(&self) -> Duration {
        let min = self.replay_delay_min.as_millis() as u64;
        let max = self.replay_delay_max.as_millis() as u64;
        if max <= min {
            return self.replay_delay_min;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }
}

/// The writing end of a turn's event channel.
///
/// Every write checks the closed flag first; a failed write sets it.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (sink, rx)
    }

    /// Returns `false` if the event was not delivered.
    pub async fn send(&self, event: ChatEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.tx.send(event).await.is_err() {
            self.closed.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// Resolves when the reading end goes away.
    pub async fn disconnected(&self) {
        self.tx.closed().await
    }

    /// Stop writing. Only the first call returns `true`.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// One user message addressed to one conversation.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub request_id: String,
    pub key: SessionKey,
    pub message: String,
}

impl ChatTurn {
    pub fn new(key: SessionKey, message: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            key,
            message: message.into(),
        }
    }
}

/// Short random hex id used to correlate log lines of one request.
pub fn new_request_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Split text into `\S+\s*` pieces. Text with no visible characters is
/// returned whole.
pub fn split_pieces(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start: Option<usize> = None;
    let mut in_gap = false;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            in_gap = start.is_some();
        } else if in_gap {
            if let Some(s) = start {
                pieces.push(&text[s..i]);
            }
            start = Some(i);
            in_gap = false;
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        pieces.push(&text[s..]);
    }
    if pieces.is_empty() {
        pieces.push(text);
    }
    pieces
}

/// Delivers chat turns for the conversational path.
pub struct ChatDelivery {
    provider: Arc<dyn Provider>,
    sessions: Arc<dyn SessionStore>,
    prompt: PromptBuilder,
    model: String,
    temperature: f32,
    max_turns: usize,
    timing: DeliveryTiming,
    diagnostics: Arc<Diagnostics>,
    events: Arc<EventBus>,
}

impl ChatDelivery {
    pub fn new(
        provider: Arc<dyn Provider>,
        sessions: Arc<dyn SessionStore>,
        prompt: PromptBuilder,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            sessions,
            prompt,
            model: model.into(),
            temperature: 0.6,
            max_turns: 20,
            timing: DeliveryTiming::default(),
            diagnostics: Arc::new(Diagnostics::new()),
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn from_config(
        provider: Arc<dyn Provider>,
        sessions: Arc<dyn SessionStore>,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            provider,
            sessions,
            PromptBuilder::from_business(&config.business),
            config.model(),
        )
        .with_temperature(config.default_temperature)
        .with_max_turns(config.history.max_turns)
        .with_timing(DeliveryTiming::from(&config.streaming))
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_timing(mut self, timing: DeliveryTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    async fn request_for(&self, turn: &ChatTurn) -> Result<ProviderRequest, ChatError> {
        let history = self
            .sessions
            .get(&turn.key)
            .await
            .map_err(|e| ChatError::server(e.to_string()))?;
        let messages = self.prompt.build(history.messages(), &turn.message);
        Ok(ProviderRequest::new(&self.model, messages).with_temperature(self.temperature))
    }

    async fn commit(&self, turn: &ChatTurn, reply: &str) {
        let result = self
            .sessions
            .commit_turn(
                &turn.key,
                Message::user(&turn.message),
                Message::assistant(reply),
                self.max_turns,
            )
            .await;
        if let Err(e) = result {
            warn!(request_id = %turn.request_id, error = %e, "Failed to store chat turn");
        }
    }

    /// Answer without streaming. Same validation and error normalization as
    /// the streamed path, no timers and no fallback.
    pub async fn reply_once(&self, turn: &ChatTurn) -> Result<String, ChatError> {
        let rid = turn.request_id.as_str();
        let result = async {
            let request = self.request_for(turn).await?;
            let response = self
                .provider
                .complete(request)
                .await
                .map_err(|e| ChatError::from(&e))?;
            let reply = response.message.content.trim().to_string();
            if reply.is_empty() {
                return Err(ChatError::no_reply());
            }
            Ok(reply)
        }
        .await;

        match result {
            Ok(reply) => {
                self.commit(turn, &reply).await;
                info!(request_id = rid, chars = reply.len(), mode = "json", "Chat reply sent");
                Ok(reply)
            }
            Err(err) => {
                self.diagnostics
                    .record(MarkerKind::SseError, rid, Some(err.error.code()));
                Err(err)
            }
        }
    }

    /// Deliver one turn as events on `sink`. Returns the terminal state.
    pub async fn run(&self, turn: ChatTurn, sink: EventSink, signal: AbortSignal) -> DeliveryState {
        let mut exchange = Exchange {
            delivery: self,
            turn: &turn,
            sink: &sink,
            signal: &signal,
            state: DeliveryState::Idle,
            received_first_token: false,
            fallback_used: false,
            heartbeat: interval_at(
                Instant::now() + self.timing.heartbeat,
                self.timing.heartbeat,
            ),
        };
        let state = exchange.drive().await;
        exchange.teardown();
        state
    }
}

/// Why the streaming phase stopped.
enum Exit {
    Ended(String),
    Fallback(AbortReason),
    Cancelled(AbortReason),
}

enum Step {
    Cancelled,
    Disconnected,
    Timeout(AbortReason),
    Opened(ChunkReceiver),
    SetupFailed(ProviderError),
    Chunk(Option<Result<StreamChunk, ProviderError>>),
    Heartbeat,
}

async fn next_chunk(rx: &mut Option<ChunkReceiver>) -> Option<Result<StreamChunk, ProviderError>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Per-request state of one streamed turn.
struct Exchange<'a> {
    delivery: &'a ChatDelivery,
    turn: &'a ChatTurn,
    sink: &'a EventSink,
    signal: &'a AbortSignal,
    state: DeliveryState,
    received_first_token: bool,
    fallback_used: bool,
    heartbeat: Interval,
}

impl Exchange<'_> {
    fn rid(&self) -> &str {
        &self.turn.request_id
    }

    fn mark(&self, kind: MarkerKind, reason: Option<AbortReason>) {
        self.delivery
            .diagnostics
            .record(kind, self.rid(), reason.as_ref().map(AbortReason::as_str));
    }

    async fn drive(&mut self) -> DeliveryState {
        if self.turn.message.trim().is_empty() {
            return self.fail(ChatError::server("Message is empty."), None).await;
        }
        let request = match self.delivery.request_for(self.turn).await {
            Ok(request) => request,
            Err(err) => return self.fail(err, None).await,
        };

        self.mark(MarkerKind::SseStart, None);
        if !self.sink.send(ChatEvent::Start).await {
            return self.disconnected();
        }
        self.state = DeliveryState::Started;

        match self.stream(&request).await {
            Exit::Ended(text) => {
                let reply = text.trim();
                if reply.is_empty() {
                    return self.fallback(&request, AbortReason::EmptyStreamReply).await;
                }
                self.delivery.commit(self.turn, reply).await;
                if !self
                    .sink
                    .send(ChatEvent::Done {
                        reply: reply.to_string(),
                        reason: None,
                    })
                    .await
                {
                    return self.disconnected();
                }
                self.mark(MarkerKind::SseDone, None);
                self.delivered(None);
                DeliveryState::Done
            }
            Exit::Fallback(reason) => self.fallback(&request, reason).await,
            Exit::Cancelled(reason) => self.cancelled(reason).await,
        }
    }

    /// Relay the provider stream until it ends or something interrupts it.
    /// The stream is dropped on return.
    async fn stream(&mut self, request: &ProviderRequest) -> Exit {
        let timing = self.delivery.timing;
        let first_token = sleep(timing.first_token_timeout);
        let overall = sleep(timing.overall_timeout);
        let provider = self.delivery.provider.clone();
        let opening = provider.stream(request.clone());
        tokio::pin!(first_token, overall, opening);

        let mut rx: Option<ChunkReceiver> = None;
        let mut aggregated = String::new();

        loop {
            let waiting_for_first = !self.received_first_token;
            let step = tokio::select! {
                biased;
                _ = self.signal.cancelled() => Step::Cancelled,
                _ = self.sink.disconnected() => Step::Disconnected,
                _ = &mut first_token, if waiting_for_first => Step::Timeout(AbortReason::FirstTokenTimeout),
                _ = &mut overall => Step::Timeout(AbortReason::OverallTimeout),
                opened = &mut opening, if rx.is_none() => match opened {
                    Ok(stream) => Step::Opened(stream),
                    Err(e) => Step::SetupFailed(e),
                },
                chunk = next_chunk(&mut rx), if rx.is_some() => Step::Chunk(chunk),
                _ = self.heartbeat.tick() => Step::Heartbeat,
            };

            match step {
                Step::Heartbeat => {
                    self.sink.send(ChatEvent::Heartbeat).await;
                }
                Step::Opened(stream) => {
                    debug!(request_id = %self.rid(), "Provider stream opened");
                    rx = Some(stream);
                }
                Step::SetupFailed(e) => {
                    warn!(request_id = %self.rid(), error = %e, "Provider stream failed to open");
                    return self.interrupt(AbortReason::StreamSetupFailure);
                }
                Step::Timeout(reason) => return self.interrupt(reason),
                Step::Cancelled => {
                    let reason = self.signal.reason().unwrap_or(AbortReason::UserAbort);
                    if reason.is_client_initiated() {
                        return Exit::Cancelled(reason);
                    }
                    return Exit::Fallback(reason);
                }
                Step::Disconnected => {
                    self.signal.abort(AbortReason::ClientDisconnect);
                    return Exit::Cancelled(AbortReason::ClientDisconnect);
                }
                Step::Chunk(None) => return Exit::Ended(aggregated),
                Step::Chunk(Some(Err(e))) => {
                    warn!(request_id = %self.rid(), error = %e, "Provider stream broke");
                    return self.interrupt(AbortReason::StreamRuntimeFailure);
                }
                Step::Chunk(Some(Ok(chunk))) => {
                    if let Some(token) = chunk.content.filter(|t| !t.is_empty()) {
                        if !self.received_first_token {
                            self.received_first_token = true;
                            self.state = DeliveryState::Streaming;
                            self.mark(MarkerKind::FirstToken, None);
                        }
                        aggregated.push_str(&token);
                        self.sink.send(ChatEvent::Token(token)).await;
                    }
                    if chunk.done {
                        return Exit::Ended(aggregated);
                    }
                }
            }
        }
    }

    /// Record why the in-flight stream is being abandoned.
    fn interrupt(&self, reason: AbortReason) -> Exit {
        self.signal.abort(reason);
        self.mark(MarkerKind::StreamAbort, Some(reason));
        Exit::Fallback(reason)
    }

    /// One non-streaming completion, replayed as tokens.
    async fn fallback(&mut self, request: &ProviderRequest, reason: AbortReason) -> DeliveryState {
        if self.fallback_used {
            return self.state;
        }
        self.fallback_used = true;
        self.state = DeliveryState::Fallback;
        self.signal.abort(reason);
        self.mark(MarkerKind::FallbackUsed, Some(reason));

        let provider = self.delivery.provider.clone();
        let completion = provider.complete(request.clone());
        tokio::pin!(completion);

        let result = loop {
            tokio::select! {
                biased;
                _ = self.sink.disconnected() => return self.disconnected(),
                result = &mut completion => break result,
                _ = self.heartbeat.tick() => {
                    self.sink.send(ChatEvent::Heartbeat).await;
                }
            }
        };

        let reply = match result {
            Ok(response) => response.message.content.trim().to_string(),
            Err(e) => return self.fail(ChatError::from(&e), Some(reason)).await,
        };
        if reply.is_empty() {
            return self.fail(ChatError::no_reply(), Some(reason)).await;
        }
        self.delivery.commit(self.turn, &reply).await;

        for (i, piece) in split_pieces(&reply).into_iter().enumerate() {
            if i > 0 {
                sleep(self.delivery.timing.replay_gap()).await;
            }
            if !self.sink.send(ChatEvent::Token(piece.to_string())).await {
                return self.disconnected();
            }
        }

        let done = ChatEvent::Done {
            reply,
            reason: Some(reason),
        };
        if !self.sink.send(done).await {
            return self.disconnected();
        }
        self.mark(MarkerKind::SseDone, Some(reason));
        self.delivered(Some(reason));
        DeliveryState::Done
    }

    async fn cancelled(&mut self, reason: AbortReason) -> DeliveryState {
        self.mark(MarkerKind::StreamAbort, Some(reason));
        if reason != AbortReason::ClientDisconnect {
            self.sink.send(ChatEvent::Aborted { reason }).await;
        }
        self.mark(MarkerKind::Aborted, Some(reason));
        DeliveryState::Aborted
    }

    fn disconnected(&mut self) -> DeliveryState {
        self.signal.abort(AbortReason::ClientDisconnect);
        self.mark(MarkerKind::Aborted, Some(AbortReason::ClientDisconnect));
        DeliveryState::Aborted
    }

    async fn fail(&mut self, err: ChatError, reason: Option<AbortReason>) -> DeliveryState {
        let err = match reason {
            Some(reason) => err.with_reason(reason.as_str()),
            None => err,
        };
        self.delivery
            .diagnostics
            .record(MarkerKind::SseError, self.rid(), Some(err.error.code()));
        self.delivery.events.publish(DomainEvent::ErrorOccurred {
            context: format!("chat:{}", self.rid()),
            error_message: err.details.clone(),
            timestamp: Utc::now(),
        });
        self.sink.send(ChatEvent::Error(err)).await;
        DeliveryState::Error
    }

    fn delivered(&self, fallback: Option<AbortReason>) {
        self.delivery.events.publish(DomainEvent::ChatDelivered {
            request_id: self.rid().to_string(),
            fallback_reason: fallback.map(|r| r.as_str().to_string()),
            timestamp: Utc::now(),
        });
    }

    fn teardown(&self) {
        if self.sink.close() {
            debug!(request_id = %self.rid(), "Delivery closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedProvider, StreamScript, text_reply};
    use concierge_core::error::ErrorKind;
    use concierge_memory::InMemorySessionStore;

    fn key() -> SessionKey {
        SessionKey::new("acme", "s1", "web")
    }

    fn build(provider: Arc<ScriptedProvider>, sessions: Arc<InMemorySessionStore>) -> ChatDelivery {
        ChatDelivery::new(
            provider,
            sessions,
            PromptBuilder::new("Bright Home", "USD"),
            "test-model",
        )
    }

    fn delivery(provider: Arc<ScriptedProvider>) -> (Arc<ChatDelivery>, Arc<InMemorySessionStore>) {
        let sessions = Arc::new(InMemorySessionStore::new());
        (Arc::new(build(provider, sessions.clone())), sessions)
    }

    async fn run_turn(delivery: &ChatDelivery, message: &str) -> (DeliveryState, Vec<ChatEvent>) {
        let (sink, mut rx) = EventSink::channel(256);
        let state = delivery
            .run(ChatTurn::new(key(), message), sink, AbortSignal::new())
            .await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (state, events)
    }

    fn names(events: &[ChatEvent]) -> Vec<&'static str> {
        events.iter().map(ChatEvent::event_type).collect()
    }

    fn tokens(events: &[ChatEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn streams_tokens_and_commits_history() {
        let provider = Arc::new(
            ScriptedProvider::new().stream_with(StreamScript::Tokens(vec!["Hello", " there", "!"])),
        );
        let (delivery, sessions) = delivery(provider.clone());

        let (state, events) = run_turn(&delivery, "hi").await;

        assert_eq!(state, DeliveryState::Done);
        assert_eq!(names(&events), vec!["start", "token", "token", "token", "done"]);
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Done {
                reply: "Hello there!".into(),
                reason: None
            })
        );
        assert_eq!(provider.complete_calls(), 0);

        let history = sessions.get(&key()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.messages()[0].content, "hi");
        assert_eq!(history.messages()[1].content, "Hello there!");
    }

    #[tokio::test(start_paused = true)]
    async fn first_token_timeout_falls_back_once() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::Stall(vec![]))
                .complete_with(text_reply("Sure thing, we can help.")),
        );
        let (delivery, sessions) = delivery(provider.clone());

        let (state, events) = run_turn(&delivery, "quote?").await;

        assert_eq!(state, DeliveryState::Done);
        let done: Vec<_> = events.iter().filter(|e| e.event_type() == "done").collect();
        assert_eq!(done.len(), 1);
        assert_eq!(
            done[0],
            &ChatEvent::Done {
                reply: "Sure thing, we can help.".into(),
                reason: Some(AbortReason::FirstTokenTimeout)
            }
        );
        assert_eq!(names(&events)[0], "start");
        assert_eq!(tokens(&events), "Sure thing, we can help.");
        assert_eq!(events.iter().filter(|e| e.event_type() == "token").count(), 5);
        assert_eq!(provider.complete_calls(), 1);
        assert_eq!(sessions.get(&key()).await.unwrap().len(), 2);

        let last = delivery.diagnostics().last_failure();
        assert_eq!(last.reason.as_deref(), Some("first_token_timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn user_abort_before_first_token_skips_fallback() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::Stall(vec![]))
                .complete_with(text_reply("unused")),
        );
        let (delivery, sessions) = delivery(provider.clone());
        let (sink, mut rx) = EventSink::channel(256);
        let signal = AbortSignal::new();

        let task = {
            let delivery = delivery.clone();
            let signal = signal.clone();
            tokio::spawn(async move { delivery.run(ChatTurn::new(key(), "hi"), sink, signal).await })
        };
        sleep(Duration::from_secs(1)).await;
        assert!(signal.abort(AbortReason::UserAbort));

        assert_eq!(task.await.unwrap(), DeliveryState::Aborted);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                ChatEvent::Start,
                ChatEvent::Aborted {
                    reason: AbortReason::UserAbort
                }
            ]
        );
        assert_eq!(provider.stream_calls(), 1);
        assert_eq!(provider.complete_calls(), 0);
        assert!(sessions.get(&key()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn client_watchdog_aborts_mid_stream() {
        let provider = Arc::new(ScriptedProvider::new().stream_with(StreamScript::Stall(vec!["Par"])));
        let (delivery, _) = delivery(provider.clone());
        let (sink, mut rx) = EventSink::channel(256);
        let signal = AbortSignal::new();

        let task = {
            let delivery = delivery.clone();
            let signal = signal.clone();
            tokio::spawn(async move { delivery.run(ChatTurn::new(key(), "hi"), sink, signal).await })
        };
        sleep(Duration::from_secs(2)).await;
        signal.abort(AbortReason::ClientWatchdog);

        assert_eq!(task.await.unwrap(), DeliveryState::Aborted);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(names(&events), vec!["start", "token", "aborted"]);
        assert_eq!(provider.complete_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_forces_fallback() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::Tokens(vec!["  ", ""]))
                .complete_with(text_reply("Recovered")),
        );
        let (delivery, _) = delivery(provider.clone());

        let (state, events) = run_turn(&delivery, "hi").await;

        assert_eq!(state, DeliveryState::Done);
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Done {
                reply: "Recovered".into(),
                reason: Some(AbortReason::EmptyStreamReply)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn setup_failure_emits_start_then_falls_back() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::Refuse(ProviderError::Network("dns".into())))
                .complete_with(text_reply("From fallback")),
        );
        let (delivery, _) = delivery(provider.clone());

        let (_, events) = run_turn(&delivery, "hi").await;

        assert_eq!(events[0], ChatEvent::Start);
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Done {
                reply: "From fallback".into(),
                reason: Some(AbortReason::StreamSetupFailure)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_failure_replays_full_reply() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::FailAfter(
                    vec!["We "],
                    ProviderError::StreamInterrupted("reset".into()),
                ))
                .complete_with(text_reply("We clean weekends too.")),
        );
        let (delivery, _) = delivery(provider.clone());

        let (state, events) = run_turn(&delivery, "weekends?").await;

        assert_eq!(state, DeliveryState::Done);
        assert_eq!(tokens(&events), "We We clean weekends too.");
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Done {
                reply: "We clean weekends too.".into(),
                reason: Some(AbortReason::StreamRuntimeFailure)
            })
        );
        assert_eq!(provider.complete_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_cuts_long_streams() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::Stall(vec!["Still ", "going"]))
                .complete_with(text_reply("Short answer.")),
        );
        let (delivery, _) = delivery(provider.clone());

        let (state, events) = run_turn(&delivery, "hi").await;

        assert_eq!(state, DeliveryState::Done);
        // 45s of silence after the first tokens: heartbeats at 10, 20, 30, 40
        assert_eq!(events.iter().filter(|e| e.event_type() == "heartbeat").count(), 4);
        assert_eq!(
            events.last(),
            Some(&ChatEvent::Done {
                reply: "Short answer.".into(),
                reason: Some(AbortReason::OverallTimeout)
            })
        );
        assert_eq!(provider.complete_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_do_not_reset_first_token_timer() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::Stall(vec![]))
                .complete_with(text_reply("ok")),
        );
        let timing = DeliveryTiming {
            first_token_timeout: Duration::from_secs(25),
            ..DeliveryTiming::default()
        };
        let delivery = build(provider, Arc::new(InMemorySessionStore::new())).with_timing(timing);

        let (_, events) = run_turn(&delivery, "hi").await;

        assert_eq!(
            names(&events),
            vec!["start", "heartbeat", "heartbeat", "token", "done"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_failure_surfaces_normalized_error() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::Stall(vec![]))
                .complete_err(ProviderError::Network("connection refused".into())),
        );
        let (delivery, sessions) = delivery(provider);

        let (state, events) = run_turn(&delivery, "hi").await;

        assert_eq!(state, DeliveryState::Error);
        match events.last() {
            Some(ChatEvent::Error(err)) => {
                assert_eq!(err.error, ErrorKind::ProviderUnreachable);
                assert_eq!(err.status, 503);
                assert_eq!(err.reason.as_deref(), Some("first_token_timeout"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(sessions.get(&key()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_fallback_reply_is_no_reply() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::Tokens(vec![]))
                .complete_with(text_reply("   ")),
        );
        let (delivery, _) = delivery(provider);

        let (state, events) = run_turn(&delivery, "hi").await;

        assert_eq!(state, DeliveryState::Error);
        match events.last() {
            Some(ChatEvent::Error(err)) => {
                assert_eq!(err.error, ErrorKind::NoReply);
                assert_eq!(err.reason.as_deref(), Some("empty_stream_reply"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_silently() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_with(StreamScript::Stall(vec![]))
                .complete_with(text_reply("unused")),
        );
        let (delivery, _) = delivery(provider.clone());
        let (sink, rx) = EventSink::channel(256);
        let signal = AbortSignal::new();

        let task = {
            let delivery = delivery.clone();
            let signal = signal.clone();
            tokio::spawn(async move { delivery.run(ChatTurn::new(key(), "hi"), sink, signal).await })
        };
        sleep(Duration::from_secs(1)).await;
        drop(rx);

        assert_eq!(task.await.unwrap(), DeliveryState::Aborted);
        assert_eq!(signal.reason(), Some(AbortReason::ClientDisconnect));
        assert_eq!(provider.complete_calls(), 0);
    }

    #[tokio::test]
    async fn reply_once_commits_and_normalizes() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .complete_with(text_reply("  Yes, we do.  "))
                .complete_with(text_reply("")),
        );
        let (delivery, sessions) = delivery(provider);

        let turn = ChatTurn::new(key(), "Do you clean ovens?");
        assert_eq!(delivery.reply_once(&turn).await.unwrap(), "Yes, we do.");
        assert_eq!(sessions.get(&key()).await.unwrap().len(), 2);

        let err = delivery.reply_once(&turn).await.unwrap_err();
        assert_eq!(err.error, ErrorKind::NoReply);
        assert_eq!(err.status, 502);
    }

    #[tokio::test]
    async fn history_is_sent_with_next_turn() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .complete_with(text_reply("first"))
                .complete_with(text_reply("second")),
        );
        let (delivery, _) = delivery(provider.clone());

        delivery.reply_once(&ChatTurn::new(key(), "one")).await.unwrap();
        delivery.reply_once(&ChatTurn::new(key(), "two")).await.unwrap();

        let second = &provider.requests()[1];
        let turns: Vec<&str> = second.messages[3..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(turns, vec!["one", "first", "two"]);
    }

    #[test]
    fn pieces_keep_trailing_whitespace() {
        assert_eq!(
            split_pieces("  Hi  there\nfriend "),
            vec!["Hi  ", "there\n", "friend "]
        );
        assert_eq!(split_pieces("one"), vec!["one"]);
        assert_eq!(split_pieces("   "), vec!["   "]);
    }

    #[test]
    fn request_ids_are_hex() {
        let id = new_request_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sink_close_is_idempotent() {
        let (sink, _rx) = EventSink::channel(1);
        assert!(sink.close());
        assert!(!sink.close());
        assert!(sink.is_closed());
    }
}
