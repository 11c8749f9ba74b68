//! Shared test doubles for the exchange engine.

use async_trait::async_trait;
use chatloop_core::error::{ToolError, TransportError};
use chatloop_core::tool::{ToolDefinition, ToolExecutor, ToolOverrides};
use chatloop_core::transport::{
    CompletionRequest, EventReceiver, StreamEvent, ToolInvocationSignal, Transport,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

/// One scripted response.
pub enum Script {
    /// Deliver these items, then end the stream.
    Stream(Vec<Result<StreamEvent, TransportError>>),
    /// Deliver these items, then cancel the token once they have all been
    /// read and keep the stream open.
    StreamThenCancel(Vec<Result<StreamEvent, TransportError>>, CancellationToken),
    /// Deliver these items, then keep the stream open until `release` is
    /// notified.
    StreamThenHold(Vec<Result<StreamEvent, TransportError>>, Arc<Notify>),
    /// Fail before any stream is opened.
    Refuse(TransportError),
}

/// A transport that plays back one [`Script`] per request and records
/// every request it receives.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Plain text responses, one per request.
    pub fn texts(responses: &[&str]) -> Self {
        Self::new(
            responses
                .iter()
                .map(|r| Script::Stream(vec![Ok(fragment(r))]))
                .collect(),
        )
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<EventReceiver, TransportError> {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front();

        let (items, cancel, hold) = match script {
            Some(Script::Stream(items)) => (items, None, None),
            Some(Script::StreamThenCancel(items, token)) => (items, Some(token), None),
            Some(Script::StreamThenHold(items, release)) => (items, None, Some(release)),
            Some(Script::Refuse(e)) => return Err(e),
            None => {
                return Err(TransportError::InvalidResponse(
                    "no scripted response left".into(),
                ));
            }
        };

        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).unwrap();
        }

        if let Some(token) = cancel {
            tokio::spawn(async move {
                while tx.capacity() < tx.max_capacity() {
                    tokio::task::yield_now().await;
                }
                token.cancel();
                tx.closed().await;
            });
        } else if let Some(release) = hold {
            tokio::spawn(async move {
                release.notified().await;
                drop(tx);
            });
        }

        Ok(rx)
    }
}

/// A recorded executor call.
#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub name: String,
    pub arguments: String,
    pub overrides: ToolOverrides,
}

/// An executor with queued results.
///
/// Offers every configured tool that the overrides do not switch off.
/// With no queued result left, a call succeeds with `"ok"`.
pub struct ScriptedExecutor {
    tools: Vec<ToolDefinition>,
    results: Mutex<VecDeque<Result<String, ToolError>>>,
    calls: Mutex<Vec<ExecutedCall>>,
    cancel_on_execute: Option<CancellationToken>,
}

impl ScriptedExecutor {
    pub fn new(tool_names: &[&str], results: Vec<Result<String, ToolError>>) -> Self {
        Self {
            tools: tool_names
                .iter()
                .map(|name| ToolDefinition {
                    name: name.to_string(),
                    description: format!("The {name} tool"),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                })
                .collect(),
            results: Mutex::new(results.into()),
            calls: Mutex::new(Vec::new()),
            cancel_on_execute: None,
        }
    }

    pub fn without_tools() -> Self {
        Self::new(&[], Vec::new())
    }

    /// Cancel `token` when executed, then never finish.
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_execute = Some(token);
        self
    }

    pub fn calls(&self) -> Vec<ExecutedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for ScriptedExecutor {
    fn definitions(&self, overrides: &ToolOverrides) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .filter(|t| overrides.is_enabled(&t.name, true))
            .cloned()
            .collect()
    }

    async fn execute(
        &self,
        name: &str,
        arguments_json: &str,
        overrides: &ToolOverrides,
    ) -> Result<String, ToolError> {
        self.calls.lock().unwrap().push(ExecutedCall {
            name: name.to_string(),
            arguments: arguments_json.to_string(),
            overrides: overrides.clone(),
        });

        if let Some(token) = &self.cancel_on_execute {
            token.cancel();
            std::future::pending::<()>().await;
        }

        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok("ok".into()))
    }
}

pub fn fragment(text: &str) -> StreamEvent {
    StreamEvent::fragment(text)
}

pub fn tool_signal(name: &str, arguments: &str, call_id: Option<&str>) -> StreamEvent {
    StreamEvent::ToolInvocation(ToolInvocationSignal {
        tool_name: name.to_string(),
        arguments_json: arguments.to_string(),
        call_id: call_id.map(str::to_string),
    })
}
