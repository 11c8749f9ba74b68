//! Exchange-level streaming events.
//!
//! `ExchangeEvent` is what a consumer (terminal, UI, socket) sees while an
//! exchange runs. Text arrives in batched commits, never per fragment.

use crate::loop_runner::ExchangeOutcome;
use serde::{Deserialize, Serialize};

/// Events emitted by the tool loop during an exchange.
///
/// - `committed`   — a batch of classified text was written into a turn
/// - `tool_call`   — the model asked for a tool
/// - `tool_result` — the tool finished (or was rejected)
/// - `done`        — the exchange is over
/// - `error`       — the transport failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeEvent {
    /// Text appended to an assistant turn.
    Committed {
        turn_id: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        visible: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reasoning: String,
    },

    /// The model is calling a tool.
    ToolCall {
        turn_id: String,
        call_id: String,
        name: String,
        arguments: String,
    },

    /// Tool execution completed.
    ToolResult {
        call_id: String,
        name: String,
        output: String,
        success: bool,
    },

    /// The exchange is complete.
    Done {
        conversation_id: String,
        outcome: ExchangeOutcome,
        requests: u32,
        tool_calls: u32,
    },

    /// The exchange failed.
    Error { message: String },
}

impl ExchangeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}
