//! Completion transports for chatloop.
//!
//! All transports implement the `chatloop_core::Transport` trait and yield
//! a stream of text fragments, optionally ending in a tool invocation.

pub mod openai_compat;

pub use openai_compat::{OpenAiCompatTransport, SseDecoder};
