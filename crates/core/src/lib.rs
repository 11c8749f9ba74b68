//! # chatloop core
//!
//! Domain types, traits, and error definitions for the chatloop exchange
//! engine. This crate has **no transport or runtime dependencies** beyond
//! `tokio::sync` — it defines the model every other crate builds on.
//!
//! The two external seams are traits:
//! - [`Transport`] streams completions from an endpoint
//! - [`ToolExecutor`] runs tools the model asks for

pub mod error;
pub mod event;
pub mod message;
pub mod tool;
pub mod transport;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result, ToolError, TransportError};
pub use event::{DomainEvent, EventBus};
pub use message::{
    Conversation, ConversationId, ImageAttachment, MessageToolCall, OutgoingMessage, Role, Turn,
};
pub use tool::{PermissionPolicy, Tool, ToolDefinition, ToolExecutor, ToolOverrides, ToolRegistry};
pub use transport::{CompletionRequest, EventReceiver, StreamEvent, ToolInvocationSignal, Transport};
