//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token, never less
//! than one token per message. Exact tokenization is not attempted; the
//! estimate only has to be cheap and monotonic for budget decisions.

use chatloop_core::message::OutgoingMessage;

/// Estimate the token count for a number of characters.
pub fn estimate_chars(chars: usize) -> usize {
    (chars / 4).max(1)
}

/// Estimate the token count for a string.
pub fn estimate_tokens(text: &str) -> usize {
    estimate_chars(text.chars().count())
}

/// Estimate tokens for one outgoing message.
///
/// Counts the text content plus, for assistant messages, each tool call's
/// name and argument JSON.
pub fn estimate_message_tokens(message: &OutgoingMessage) -> usize {
    let mut chars = message.content.as_deref().map_or(0, |c| c.chars().count());
    if let Some(calls) = &message.tool_calls {
        chars += calls
            .iter()
            .map(|c| c.name.chars().count() + c.arguments.chars().count())
            .sum::<usize>();
    }
    estimate_chars(chars)
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[OutgoingMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloop_core::message::MessageToolCall;

    #[test]
    fn empty_string_costs_one() {
        assert_eq!(estimate_tokens(""), 1);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn rounds_down() {
        assert_eq!(estimate_tokens("hello wor"), 2);
    }

    #[test]
    fn counts_characters_not_bytes() {
        // 8 chars, 16+ bytes
        assert_eq!(estimate_tokens("ééééüüüü"), 2);
    }

    #[test]
    fn assistant_tool_calls_are_counted() {
        let call = MessageToolCall {
            id: "call_1".into(),
            name: "calc".into(),
            arguments: r#"{"expr":"2+2"}"#.into(),
        };
        // 4 + 14 chars = 18 → 4 tokens
        let msg = OutgoingMessage::assistant("", &[call]);
        assert_eq!(estimate_message_tokens(&msg), 4);
    }

    #[test]
    fn multiple_messages() {
        let msgs = vec![
            OutgoingMessage::user("12345678", vec![]),
            OutgoingMessage::tool("call_1", "1234"),
        ];
        assert_eq!(estimate_messages_tokens(&msgs), 3);
    }
}
