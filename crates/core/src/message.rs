//! Turn and Conversation domain types.
//!
//! A [`Turn`] is one entry in the conversation history. Assistant turns are
//! created empty and grow in place while a response streams; every other
//! turn is immutable once pushed. [`OutgoingMessage`] is the wire-shaped
//! projection of a turn, built fresh for every request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a turn's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// A tool result fed back to the model
    Tool,
}

impl Role {
    /// Wire name used by chat-completion APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool call issued by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Call ID, echoed back by the matching tool turn
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a raw JSON string
    pub arguments: String,
}

/// A binary image attached to a user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// MIME type, e.g. `image/png`
    pub mime_type: String,

    /// Raw image bytes
    pub data: Vec<u8>,
}

impl ImageAttachment {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// A single turn in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Unique turn ID
    pub id: String,

    /// Who produced this turn
    pub role: Role,

    /// Visible text content (for tool turns: the tool result)
    pub content: String,

    /// Reasoning text, kept apart from the visible answer (assistant only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reasoning: String,

    /// Tool calls requested by the assistant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// Tool results keyed by call ID (assistant only)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_results: BTreeMap<String, String>,

    /// For tool turns: which call this result answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Attached images (user only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,

    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    fn with_role(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            reasoning: String::new(),
            tool_calls: Vec::new(),
            tool_results: BTreeMap::new(),
            tool_call_id: None,
            images: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a new user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    /// Create a user turn carrying images.
    pub fn user_with_images(content: impl Into<String>, images: Vec<ImageAttachment>) -> Self {
        let mut turn = Self::user(content);
        turn.images = images;
        turn
    }

    /// Create a new assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    /// Create an empty assistant turn to stream into.
    pub fn assistant_placeholder() -> Self {
        Self::assistant(String::new())
    }

    /// Create a new system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// Create a tool result turn.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut turn = Self::with_role(Role::Tool, content.into());
        turn.tool_call_id = Some(tool_call_id.into());
        turn
    }

    /// Whether the visible content has any non-whitespace text.
    pub fn has_text(&self) -> bool {
        !self.content.trim().is_empty()
    }

    /// An assistant turn with neither text nor tool calls cannot be sent.
    pub fn is_empty_assistant(&self) -> bool {
        self.role == Role::Assistant && !self.has_text() && self.tool_calls.is_empty()
    }
}

/// The wire-shaped projection of a [`Turn`] for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub role: Role,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<MessageToolCall>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

impl OutgoingMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            images: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>, images: Vec<ImageAttachment>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            images,
        }
    }

    /// Assistant message; empty text becomes `None`, empty calls become `None`.
    pub fn assistant(content: &str, tool_calls: &[MessageToolCall]) -> Self {
        Self {
            role: Role::Assistant,
            content: (!content.trim().is_empty()).then(|| content.to_string()),
            tool_calls: (!tool_calls.is_empty()).then(|| tool_calls.to_vec()),
            tool_call_id: None,
            images: Vec::new(),
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            images: Vec::new(),
        }
    }
}

/// A conversation is an ordered sequence of turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Ordered turns
    pub turns: Vec<Turn>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last turn was added or changed
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a turn to the conversation.
    pub fn push(&mut self, turn: Turn) {
        self.updated_at = Utc::now();
        self.turns.push(turn);
    }

    /// Find a turn by ID.
    pub fn get_mut(&mut self, turn_id: &str) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.id == turn_id)
    }

    /// Mark the conversation as modified.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Drop the given turn and everything after it (edit / regenerate).
    ///
    /// Returns the number of turns removed; unknown IDs remove nothing.
    pub fn truncate_from(&mut self, turn_id: &str) -> usize {
        let Some(index) = self.turns.iter().position(|t| t.id == turn_id) else {
            return 0;
        };
        let removed = self.turns.len() - index;
        self.turns.truncate(index);
        self.touch();
        removed
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_turn() {
        let turn = Turn::user("Hello!");
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.content, "Hello!");
        assert!(turn.tool_calls.is_empty());
        assert!(turn.tool_call_id.is_none());
    }

    #[test]
    fn placeholder_is_empty_assistant() {
        let turn = Turn::assistant_placeholder();
        assert!(turn.is_empty_assistant());

        let mut with_call = Turn::assistant_placeholder();
        with_call.tool_calls.push(MessageToolCall {
            id: "call_1".into(),
            name: "clock".into(),
            arguments: "{}".into(),
        });
        assert!(!with_call.is_empty_assistant());
    }

    #[test]
    fn whitespace_only_text_does_not_count() {
        assert!(Turn::assistant("  \n").is_empty_assistant());
        assert!(!Turn::assistant(" ok ").is_empty_assistant());
    }

    #[test]
    fn tool_turn_carries_call_id() {
        let turn = Turn::tool_result("call_9", "42");
        assert_eq!(turn.role, Role::Tool);
        assert_eq!(turn.tool_call_id.as_deref(), Some("call_9"));
    }

    #[test]
    fn outgoing_assistant_nulls_empty_fields() {
        let msg = OutgoingMessage::assistant("", &[]);
        assert!(msg.content.is_none());
        assert!(msg.tool_calls.is_none());

        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("content"));
        assert!(json.contains(r#""role":"assistant""#));
    }

    #[test]
    fn conversation_tracks_updates() {
        let mut conv = Conversation::new();
        let created = conv.created_at;

        conv.push(Turn::user("First"));
        assert_eq!(conv.turns.len(), 1);
        assert!(conv.updated_at >= created);
    }

    #[test]
    fn truncate_from_removes_tail() {
        let mut conv = Conversation::new();
        conv.push(Turn::user("one"));
        let second = Turn::assistant("two");
        let second_id = second.id.clone();
        conv.push(second);
        conv.push(Turn::user("three"));

        assert_eq!(conv.truncate_from(&second_id), 2);
        assert_eq!(conv.turns.len(), 1);
        assert_eq!(conv.turns[0].content, "one");

        assert_eq!(conv.truncate_from("missing"), 0);
        assert_eq!(conv.turns.len(), 1);
    }

    #[test]
    fn turn_serialization_skips_empty_fields() {
        let turn = Turn::user("Test");
        let json = serde_json::to_string(&turn).unwrap();
        assert!(!json.contains("reasoning"));
        assert!(!json.contains("tool_results"));
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content, "Test");
        assert_eq!(back.role, Role::User);
    }
}
