//! `concierge ask`: one question from the terminal.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use concierge_agent::{
    AbortReason, AbortSignal, AgentRequest, ChatDelivery, ChatEvent, ChatTurn, EVENT_BUFFER,
    EventSink, ToolLoop,
};
use concierge_config::AppConfig;
use concierge_core::event::EventBus;
use concierge_core::message::Message;
use concierge_core::provider::Provider;
use concierge_core::session::SessionKey;
use concierge_memory::InMemorySessionStore;
use concierge_providers::OpenAiCompatProvider;

pub async fn run(
    config_path: Option<&Path>,
    message: String,
    chat: bool,
    no_stream: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    CONCIERGE_API_KEY=sk-...");
        eprintln!("    OPENAI_API_KEY=sk-...");
        eprintln!();
        eprintln!("  Or add `api_key` to your config file:");
        eprintln!("    {}", super::config_path(config_path).display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let provider: Arc<dyn Provider> = Arc::new(OpenAiCompatProvider::from_config(&config));

    if chat {
        ask_chat(&config, provider, message, no_stream).await
    } else {
        ask_agent(&config, provider, message).await
    }
}

async fn ask_agent(
    config: &AppConfig,
    provider: Arc<dyn Provider>,
    message: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let events = Arc::new(EventBus::default());
    let tools = Arc::new(concierge_tools::default_registry(
        &config.business,
        events.clone(),
    ));
    let agent = ToolLoop::from_config(provider, tools, config, events);

    let reply = agent.run(AgentRequest::new(vec![Message::user(message)])).await?;

    tracing::debug!(rounds = reply.rounds, outcome = ?reply.outcome, "Agent turn finished");
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn ask_chat(
    config: &AppConfig,
    provider: Arc<dyn Provider>,
    message: String,
    no_stream: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let sessions = Arc::new(InMemorySessionStore::new());
    let delivery = Arc::new(ChatDelivery::from_config(provider, sessions, config));
    let turn = ChatTurn::new(SessionKey::new("cli", "local", "terminal"), message);

    if no_stream {
        let reply = delivery.reply_once(&turn).await?;
        println!("{reply}");
        return Ok(());
    }

    let (sink, mut rx) = EventSink::channel(EVENT_BUFFER);
    let signal = AbortSignal::new();
    let task = {
        let delivery = delivery.clone();
        let signal = signal.clone();
        tokio::spawn(async move { delivery.run(turn, sink, signal).await })
    };

    let mut stdout = std::io::stdout();
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                signal.abort(AbortReason::UserAbort);
                continue;
            }
        };
        let Some(event) = event else { break };

        match event {
            ChatEvent::Token(token) => {
                print!("{token}");
                stdout.flush()?;
            }
            ChatEvent::Done { reason, .. } => {
                println!();
                if let Some(reason) = reason {
                    tracing::debug!(reason = %reason, "Reply came from fallback");
                }
            }
            ChatEvent::Error(err) => {
                println!();
                return Err(err.into());
            }
            ChatEvent::Aborted { reason } => {
                println!();
                eprintln!("  (cancelled: {reason})");
            }
            ChatEvent::Start | ChatEvent::Heartbeat => {}
        }
    }

    task.await?;
    Ok(())
}
