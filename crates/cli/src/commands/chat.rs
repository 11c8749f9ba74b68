//! `chatloop chat` — Run one exchange and stream the answer to stdout.

use std::io::Write;
use std::sync::Arc;

use chatloop_agent::{ExchangeEvent, ExchangeOutcome, SharedConversation, ToolLoop};
use chatloop_config::AppConfig;
use chatloop_core::event::EventBus;
use chatloop_core::message::{Conversation, Turn};
use chatloop_providers::OpenAiCompatTransport;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

pub async fn run(
    message: String,
    show_reasoning: bool,
    max_attempts: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    let mut settings = config.exchange_settings();
    if let Some(n) = max_attempts {
        settings = settings.with_max_attempts(n);
    }

    if !config.has_api_key() {
        tracing::debug!(api_url = %config.api_url, "No API key configured; sending unauthenticated requests");
    }

    let transport = Arc::new(OpenAiCompatTransport::from_config(&config)?);
    let executor = Arc::new(crate::tools::default_registry());
    let tool_loop = ToolLoop::new(transport, executor, Arc::new(EventBus::default()));

    let conversation: SharedConversation = Arc::new(RwLock::new(Conversation::new()));
    conversation.write().await.push(Turn::user(message));

    // Ctrl-C cancels the exchange; buffered text is still flushed
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, rx) = mpsc::channel(32);
    let printer = tokio::spawn(print_events(rx, show_reasoning));

    let result = tool_loop.run(&conversation, &settings, &cancel, Some(tx)).await;
    printer.await??;

    let report = result?;
    if report.outcome != ExchangeOutcome::Completed {
        eprintln!(
            "  [{}] after {} request(s), {} tool call(s)",
            report.outcome, report.requests, report.tool_calls
        );
    }

    Ok(())
}

/// Render exchange events: answer text to stdout, everything else to stderr.
async fn print_events(
    mut rx: mpsc::Receiver<ExchangeEvent>,
    show_reasoning: bool,
) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    while let Some(event) = rx.recv().await {
        match event {
            ExchangeEvent::Committed {
                visible, reasoning, ..
            } => {
                if show_reasoning && !reasoning.is_empty() {
                    write!(stderr, "{reasoning}")?;
                    stderr.flush()?;
                }
                if !visible.is_empty() {
                    write!(stdout, "{visible}")?;
                    stdout.flush()?;
                }
            }
            ExchangeEvent::ToolCall {
                name, arguments, ..
            } => {
                writeln!(stderr, "\n  [tool] {name}({arguments})")?;
            }
            ExchangeEvent::ToolResult {
                name,
                output,
                success,
                ..
            } => {
                let mark = if success { "ok" } else { "rejected" };
                writeln!(stderr, "  [tool] {name} {mark}: {output}")?;
            }
            ExchangeEvent::Done { .. } => {
                writeln!(stdout)?;
            }
            ExchangeEvent::Error { message } => {
                writeln!(stderr, "\n  [Error] {message}")?;
            }
        }
    }

    Ok(())
}
