//! Scripted provider shared by the agent tests.

use async_trait::async_trait;
use concierge_core::error::ProviderError;
use concierge_core::message::{Message, MessageToolCall};
use concierge_core::provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

type ChunkSender = mpsc::Sender<Result<StreamChunk, ProviderError>>;

/// What one `stream()` call does.
pub enum StreamScript {
    /// Send the tokens, then end the stream.
    Tokens(Vec<&'static str>),
    /// Send the tokens, then go silent without ending.
    Stall(Vec<&'static str>),
    /// Send the tokens, then fail.
    FailAfter(Vec<&'static str>, ProviderError),
    /// Opening the stream fails.
    Refuse(ProviderError),
}

/// Replays queued completions and streams, counting calls.
#[derive(Default)]
pub struct ScriptedProvider {
    completions: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    requests: Mutex<Vec<ProviderRequest>>,
    held: Mutex<Vec<ChunkSender>>,
    complete_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete_with(self, response: ProviderResponse) -> Self {
        self.completions.lock().unwrap().push_back(Ok(response));
        self
    }

    pub fn complete_err(self, err: ProviderError) -> Self {
        self.completions.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn stream_with(self, script: StreamScript) -> Self {
        self.streams.lock().unwrap().push_back(script);
        self
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Every request seen by `complete`, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn exhausted() -> ProviderError {
    ProviderError::ApiError {
        status_code: 500,
        message: "script exhausted".into(),
    }
}

fn channel_with(tokens: &[&str]) -> (ChunkSender, ChunkReceiver) {
    let (tx, rx) = mpsc::channel(tokens.len() + 2);
    for token in tokens {
        tx.try_send(Ok(StreamChunk::token(*token))).unwrap();
    }
    (tx, rx)
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(exhausted()))
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.streams.lock().unwrap().pop_front();
        match script {
            Some(StreamScript::Tokens(tokens)) => Ok(channel_with(&tokens).1),
            Some(StreamScript::Stall(tokens)) => {
                let (tx, rx) = channel_with(&tokens);
                self.held.lock().unwrap().push(tx);
                Ok(rx)
            }
            Some(StreamScript::FailAfter(tokens, err)) => {
                let (tx, rx) = channel_with(&tokens);
                tx.try_send(Err(err)).unwrap();
                Ok(rx)
            }
            Some(StreamScript::Refuse(err)) => Err(err),
            None => Err(exhausted()),
        }
    }
}

pub fn text_reply(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: None,
        model: "scripted".into(),
    }
}

pub fn tool_reply(calls: Vec<MessageToolCall>) -> ProviderResponse {
    let mut message = Message::assistant("");
    message.tool_calls = calls;
    ProviderResponse {
        message,
        usage: None,
        model: "scripted".into(),
    }
}

pub fn tool_call(id: &str, name: &str, arguments: &str) -> MessageToolCall {
    MessageToolCall {
        id: id.into(),
        name: name.into(),
        arguments: arguments.into(),
    }
}
