//! Transport trait — the abstraction over streaming completion endpoints.
//!
//! A transport takes a [`CompletionRequest`] and hands back a channel of
//! [`StreamEvent`]s: zero or more text fragments, optionally terminated by a
//! [`ToolInvocationSignal`] when the model wants to call a tool instead of
//! continuing to write.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::message::OutgoingMessage;
use crate::tool::ToolDefinition;

/// One request to the completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The model to use
    pub model: String,

    /// Composed message list
    pub messages: Vec<OutgoingMessage>,

    /// Sampling temperature
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Enabled tools; omitted from the wire when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Whether to stream the response
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    /// `"auto"` when tools are offered, otherwise no tool choice at all.
    pub fn tool_choice(&self) -> Option<&'static str> {
        (!self.tools.is_empty()).then_some("auto")
    }
}

/// "Stop streaming text, the model wants to call a tool now."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocationSignal {
    /// Name of the requested tool
    pub tool_name: String,

    /// Raw JSON argument string, as produced by the model
    pub arguments_json: String,

    /// Call ID supplied by the endpoint, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl ToolInvocationSignal {
    /// The endpoint-supplied call ID, ignoring blanks.
    pub fn supplied_call_id(&self) -> Option<&str> {
        self.call_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// A single event from a streaming transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// An incremental piece of text. May be empty.
    Fragment { text: String },

    /// Terminal: the model wants to invoke a tool.
    ToolInvocation(ToolInvocationSignal),
}

impl StreamEvent {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self::Fragment { text: text.into() }
    }
}

/// Receiving half of a transport stream.
pub type EventReceiver = mpsc::Receiver<std::result::Result<StreamEvent, TransportError>>;

/// The core Transport trait.
///
/// The orchestrator calls `stream()` without knowing which endpoint is
/// behind it. A closed channel means the stream ended normally.
#[async_trait]
pub trait Transport: Send + Sync {
    /// A human-readable name for this transport (e.g., "openai-compat").
    fn name(&self) -> &str;

    /// Send a request and get a stream of events.
    async fn stream(&self, request: CompletionRequest) -> std::result::Result<EventReceiver, TransportError>;
}
