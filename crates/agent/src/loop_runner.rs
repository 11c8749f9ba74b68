//! The tool loop — one user-initiated exchange with the model.
//!
//! Each attempt goes **Compose → Stream → (Done | Tool → Execute)**:
//!
//! 1. **Compose** the outgoing context from the live history
//! 2. **Stream** the response, classifying fragments into visible and
//!    reasoning text and committing them in batches
//! 3. **If the stream ends normally**: the exchange is complete
//! 4. **If the model asks for a tool**: record the call, execute it, append
//!    the result, open a fresh assistant turn and go back to step 1
//!
//! A rejected tool ends the exchange immediately. A successful one continues
//! until `max_attempts` requests have been issued.

use crate::context::{CompositionMetadata, ContextComposer, TokenBudget};
use crate::stream::{PendingCommit, StreamSession};
use crate::stream_event::ExchangeEvent;
use chatloop_config::ExchangeSettings;
use chatloop_core::error::{Error, TransportError};
use chatloop_core::event::{DomainEvent, EventBus};
use chatloop_core::message::{Conversation, MessageToolCall, Role, Turn};
use chatloop_core::tool::ToolExecutor;
use chatloop_core::transport::{
    CompletionRequest, EventReceiver, StreamEvent, ToolInvocationSignal, Transport,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The live conversation, shared between the loop and its observers.
pub type SharedConversation = Arc<RwLock<Conversation>>;

/// Prefix stored as the result of a tool that did not run successfully.
pub const REJECTED_PREFIX: &str = "[REJECTED]";

/// How an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    /// The model finished without asking for another tool.
    Completed,
    /// A tool failed; the loop stopped after recording the rejection.
    ToolRejected,
    /// Every attempt was used on tool calls.
    AttemptsExhausted,
    /// The caller cancelled.
    Cancelled,
}

impl ExchangeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ToolRejected => "tool_rejected",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExchangeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished exchange.
#[derive(Debug, Clone)]
pub struct ExchangeReport {
    pub outcome: ExchangeOutcome,
    /// Completion requests issued.
    pub requests: u32,
    /// Tool calls executed (or rejected).
    pub tool_calls: u32,
    /// Composition statistics of the last request.
    pub last_context: Option<CompositionMetadata>,
}

/// How one streamed attempt ended.
enum StreamEnd {
    Finished,
    ToolRequested(ToolInvocationSignal),
    Cancelled,
}

/// What happened to a requested tool call.
enum ToolStep {
    Succeeded,
    Rejected,
    Cancelled,
}

/// Optional consumer of [`ExchangeEvent`]s.
///
/// A dropped receiver is not an error; the exchange keeps going.
struct EventSink(Option<mpsc::Sender<ExchangeEvent>>);

impl EventSink {
    async fn send(&self, event: ExchangeEvent) {
        if let Some(tx) = &self.0
            && tx.send(event).await.is_err()
        {
            debug!("Exchange event receiver dropped");
        }
    }
}

/// Drives transport, stream decoding and tool execution for one exchange
/// at a time. Cheap to share; holds no per-exchange state.
pub struct ToolLoop {
    transport: Arc<dyn Transport>,
    executor: Arc<dyn ToolExecutor>,
    event_bus: Arc<EventBus>,
}

impl ToolLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        executor: Arc<dyn ToolExecutor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            transport,
            executor,
            event_bus,
        }
    }

    /// Run one exchange against the live conversation.
    ///
    /// The user turn must already be in `conversation`. Only transport
    /// failures are returned as errors; a rejected tool, an exhausted
    /// attempt cap and cancellation are reported through the outcome.
    pub async fn run(
        &self,
        conversation: &SharedConversation,
        settings: &ExchangeSettings,
        cancel: &CancellationToken,
        events: Option<mpsc::Sender<ExchangeEvent>>,
    ) -> Result<ExchangeReport, Error> {
        let sink = EventSink(events);
        let max_attempts = settings.max_attempts.max(1);
        let conversation_id = conversation.read().await.id.to_string();

        info!(
            conversation_id = %conversation_id,
            model = %settings.model,
            transport = self.transport.name(),
            max_attempts,
            "Starting exchange"
        );
        self.event_bus.publish(DomainEvent::ExchangeStarted {
            conversation_id: conversation_id.clone(),
            model: settings.model.clone(),
            timestamp: Utc::now(),
        });

        let composer = ContextComposer::for_budget(TokenBudget::new(
            settings.context_length,
            settings.max_response_tokens,
        ));
        let tools = self.executor.definitions(&settings.tool_overrides);
        let mut turn_id = Self::open_assistant_turn(conversation).await;

        let mut report = ExchangeReport {
            outcome: ExchangeOutcome::AttemptsExhausted,
            requests: 0,
            tool_calls: 0,
            last_context: None,
        };

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                report.outcome = ExchangeOutcome::Cancelled;
                break;
            }

            // ── Compose ──
            let context = {
                let conv = conversation.read().await;
                composer.compose(&conv.turns, &settings.system_prompt)
            };
            debug!(
                conversation_id = %conversation_id,
                attempt,
                messages = context.messages.len(),
                estimated_tokens = context.metadata.total_tokens,
                budget = context.metadata.budget,
                "Issuing completion request"
            );
            self.event_bus.publish(DomainEvent::RequestIssued {
                conversation_id: conversation_id.clone(),
                attempt,
                messages: context.messages.len(),
                estimated_tokens: context.metadata.total_tokens,
                timestamp: Utc::now(),
            });

            let request = CompletionRequest {
                model: settings.model.clone(),
                messages: context.messages,
                temperature: settings.temperature,
                max_tokens: Some(settings.max_response_tokens),
                tools: tools.clone(),
                stream: true,
            };
            report.requests += 1;
            report.last_context = Some(context.metadata);

            // ── Stream ──
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.transport.stream(request) => Some(result),
            };
            let rx = match opened {
                None => {
                    report.outcome = ExchangeOutcome::Cancelled;
                    break;
                }
                Some(Ok(rx)) => rx,
                Some(Err(e)) => {
                    return Err(self.fail(conversation, &turn_id, &conversation_id, &sink, e).await);
                }
            };

            let end = self
                .consume(rx, conversation, &turn_id, settings, cancel, &sink)
                .await;

            // ── Dispatch ──
            match end {
                Ok(StreamEnd::Finished) => {
                    report.outcome = ExchangeOutcome::Completed;
                    break;
                }
                Ok(StreamEnd::Cancelled) => {
                    report.outcome = ExchangeOutcome::Cancelled;
                    break;
                }
                Ok(StreamEnd::ToolRequested(signal)) => {
                    report.tool_calls += 1;
                    let step = self
                        .execute_tool(conversation, &turn_id, signal, settings, cancel, &sink)
                        .await;
                    match step {
                        ToolStep::Succeeded if attempt < max_attempts => {
                            let mut conv = conversation.write().await;
                            let turn = Turn::assistant_placeholder();
                            turn_id = turn.id.clone();
                            conv.push(turn);
                        }
                        ToolStep::Succeeded => {
                            warn!(
                                conversation_id = %conversation_id,
                                max_attempts,
                                "Tool loop attempt cap reached"
                            );
                        }
                        ToolStep::Rejected => {
                            report.outcome = ExchangeOutcome::ToolRejected;
                            break;
                        }
                        ToolStep::Cancelled => {
                            report.outcome = ExchangeOutcome::Cancelled;
                            break;
                        }
                    }
                }
                Err(e) => {
                    return Err(self.fail(conversation, &turn_id, &conversation_id, &sink, e).await);
                }
            }
        }

        info!(
            conversation_id = %conversation_id,
            outcome = %report.outcome,
            requests = report.requests,
            tool_calls = report.tool_calls,
            "Exchange finished"
        );
        sink.send(ExchangeEvent::Done {
            conversation_id: conversation_id.clone(),
            outcome: report.outcome,
            requests: report.requests,
            tool_calls: report.tool_calls,
        })
        .await;
        self.event_bus.publish(DomainEvent::ExchangeFinished {
            conversation_id,
            outcome: report.outcome.to_string(),
            requests: report.requests,
            timestamp: Utc::now(),
        });

        Ok(report)
    }

    /// Reuse a trailing empty assistant turn or append a new one.
    async fn open_assistant_turn(conversation: &SharedConversation) -> String {
        let mut conv = conversation.write().await;
        if let Some(last) = conv.turns.last()
            && last.is_empty_assistant()
        {
            return last.id.clone();
        }
        let turn = Turn::assistant_placeholder();
        let id = turn.id.clone();
        conv.push(turn);
        id
    }

    /// Read one attempt's stream to its end.
    ///
    /// Fragments are classified and committed as the scheduler decides; an
    /// idle timer commits buffered text when the transport stalls. Any
    /// terminal condition force-flushes what is still buffered.
    async fn consume(
        &self,
        mut rx: EventReceiver,
        conversation: &SharedConversation,
        turn_id: &str,
        settings: &ExchangeSettings,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> Result<StreamEnd, TransportError> {
        let mut session =
            StreamSession::new(&settings.open_marker, &settings.close_marker, Instant::now());

        loop {
            let deadline = session.next_deadline();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(turn_id, "Exchange cancelled mid-stream");
                    Self::commit(conversation, turn_id, session.finish(), &mut session, sink).await;
                    return Ok(StreamEnd::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let due = session.take_due(Instant::now());
                    Self::commit(conversation, turn_id, due, &mut session, sink).await;
                }
                item = rx.recv() => match item {
                    None => {
                        Self::commit(conversation, turn_id, session.finish(), &mut session, sink).await;
                        return Ok(StreamEnd::Finished);
                    }
                    Some(Ok(StreamEvent::Fragment { text })) => {
                        let due = session.push_fragment(&text, Instant::now());
                        Self::commit(conversation, turn_id, due, &mut session, sink).await;
                    }
                    Some(Ok(StreamEvent::ToolInvocation(signal))) => {
                        Self::commit(conversation, turn_id, session.finish(), &mut session, sink).await;
                        return Ok(StreamEnd::ToolRequested(signal));
                    }
                    Some(Err(e)) => {
                        Self::commit(conversation, turn_id, session.finish(), &mut session, sink).await;
                        return Err(e);
                    }
                },
            }
        }
    }

    /// Append a batch to the assistant turn and report how long it took.
    async fn commit(
        conversation: &SharedConversation,
        turn_id: &str,
        pending: Option<PendingCommit>,
        session: &mut StreamSession,
        sink: &EventSink,
    ) {
        let Some(pending) = pending else {
            return;
        };
        let started = Instant::now();

        {
            let mut conv = conversation.write().await;
            match conv.get_mut(turn_id) {
                Some(turn) => {
                    turn.content.push_str(&pending.visible);
                    turn.reasoning.push_str(&pending.reasoning);
                    conv.touch();
                }
                None => warn!(turn_id, "Assistant turn vanished during streaming; commit dropped"),
            }
        }

        sink.send(ExchangeEvent::Committed {
            turn_id: turn_id.to_string(),
            visible: pending.visible,
            reasoning: pending.reasoning,
        })
        .await;

        let now = Instant::now();
        session.record_commit(now, now.saturating_duration_since(started));
    }

    /// Record, execute and store one tool call.
    async fn execute_tool(
        &self,
        conversation: &SharedConversation,
        turn_id: &str,
        signal: ToolInvocationSignal,
        settings: &ExchangeSettings,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> ToolStep {
        let call_id = signal
            .supplied_call_id()
            .map(str::to_string)
            .unwrap_or_else(generate_call_id);
        let arguments = if signal.arguments_json.trim().is_empty() {
            "{}".to_string()
        } else {
            signal.arguments_json
        };
        let name = signal.tool_name;

        {
            let mut conv = conversation.write().await;
            if let Some(turn) = conv.get_mut(turn_id) {
                turn.tool_calls.push(MessageToolCall {
                    id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
            }
        }
        sink.send(ExchangeEvent::ToolCall {
            turn_id: turn_id.to_string(),
            call_id: call_id.clone(),
            name: name.clone(),
            arguments: arguments.clone(),
        })
        .await;

        debug!(tool = %name, call_id = %call_id, "Executing tool call");
        let started = std::time::Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.executor.execute(&name, &arguments, &settings.tool_overrides) => Some(result),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (output, step) = match result {
            Some(Ok(output)) => (output, ToolStep::Succeeded),
            Some(Err(e)) => {
                warn!(tool = %name, call_id = %call_id, error = %e, "Tool call rejected");
                (format!("{REJECTED_PREFIX} {e}"), ToolStep::Rejected)
            }
            None => {
                debug!(tool = %name, call_id = %call_id, "Tool call cancelled");
                (format!("{REJECTED_PREFIX} Tool call cancelled"), ToolStep::Cancelled)
            }
        };
        let success = matches!(step, ToolStep::Succeeded);

        {
            let mut conv = conversation.write().await;
            if let Some(turn) = conv.get_mut(turn_id) {
                turn.tool_results.insert(call_id.clone(), output.clone());
            }
            conv.push(Turn::tool_result(call_id.clone(), output.clone()));
        }

        self.event_bus.publish(DomainEvent::ToolExecuted {
            tool_name: name.clone(),
            success,
            duration_ms,
            timestamp: Utc::now(),
        });
        sink.send(ExchangeEvent::ToolResult {
            call_id,
            name,
            output,
            success,
        })
        .await;

        step
    }

    /// Put the failure into the assistant turn and tell observers.
    async fn fail(
        &self,
        conversation: &SharedConversation,
        turn_id: &str,
        conversation_id: &str,
        sink: &EventSink,
        error: TransportError,
    ) -> Error {
        warn!(conversation_id, error = %error, "Transport failed; exchange aborted");

        {
            let mut conv = conversation.write().await;
            if let Some(turn) = conv.get_mut(turn_id) {
                turn.content = format!("Error: {error}");
            }
            conv.touch();
        }

        sink.send(ExchangeEvent::Error {
            message: error.to_string(),
        })
        .await;
        self.event_bus.publish(DomainEvent::ErrorOccurred {
            context: format!("exchange {conversation_id}"),
            error_message: error.to_string(),
            timestamp: Utc::now(),
        });

        Error::Transport(error)
    }
}

/// Call IDs for endpoints that do not supply one.
fn generate_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

/// Whether a stored tool result is a rejection.
pub fn is_rejected(output: &str) -> bool {
    output.starts_with(REJECTED_PREFIX)
}

/// Last assistant turn's visible text, for callers that want a plain answer.
pub fn final_answer(conversation: &Conversation) -> Option<&str> {
    conversation
        .turns
        .iter()
        .rev()
        .find(|t| t.role == Role::Assistant && t.has_text())
        .map(|t| t.content.as_str())
}
