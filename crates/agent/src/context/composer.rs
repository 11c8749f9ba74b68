//! Context composition — turn history to outgoing message list.
//!
//! Builds the exact ordered [`OutgoingMessage`] list for one request:
//!
//! 1. **System prompt** — first, never pruned
//! 2. **History** — turns mapped to wire messages in order; the streaming
//!    placeholder and malformed assistant turns are left out
//! 3. **Pruning** — oldest history dropped first until the estimate fits the
//!    budget; the newest message always survives
//! 4. **Orphan cleanup** — the list never starts with a `tool` message whose
//!    originating call was pruned away
//!
//! # Determinism
//!
//! Composition is deterministic: identical turns, prompt and budget always
//! produce identical output.

use crate::context::token;
use chatloop_core::message::{OutgoingMessage, Role, Turn};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ── Types ─────────────────────────────────────────────────────────────────

/// Token budget numbers for one request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    /// Context window of the model.
    pub context_length: usize,
    /// Tokens reserved for the response.
    pub reserved_response_tokens: usize,
}

impl TokenBudget {
    pub fn new(context_length: u32, reserved_response_tokens: u32) -> Self {
        Self {
            context_length: context_length as usize,
            reserved_response_tokens: reserved_response_tokens as usize,
        }
    }

    /// Tokens available for the prompt. Never below 1.
    pub fn available(&self) -> usize {
        self.context_length
            .saturating_sub(self.reserved_response_tokens)
            .max(1)
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(8192, 4096)
    }
}

/// The composed request context.
#[derive(Debug, Clone)]
pub struct ComposedContext {
    /// Messages in wire order.
    pub messages: Vec<OutgoingMessage>,
    /// What happened during composition.
    pub metadata: CompositionMetadata,
}

/// Statistics about one composition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompositionMetadata {
    /// Estimated tokens of the composed list.
    pub total_tokens: usize,
    /// Budget the list was pruned against.
    pub budget: usize,
    /// Budget utilization percentage.
    pub utilization_pct: f32,
    /// Malformed turns left out of the request.
    pub malformed_skipped: usize,
    /// Messages removed from the head of the history.
    pub drops: Vec<DropInfo>,
}

/// Messages dropped for one reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropInfo {
    /// Number of messages dropped.
    pub items_dropped: usize,
    /// Estimated tokens of dropped content.
    pub tokens_dropped: usize,
    /// Reason for dropping.
    pub reason: String,
}

/// A run of history messages pruned as a unit: one message plus the tool
/// results that directly follow it.
struct Group {
    messages: Vec<OutgoingMessage>,
    tokens: usize,
    orphan: bool,
}

// ── Composer ──────────────────────────────────────────────────────────────

/// The context composer. Stateless; create one per budget and reuse it.
#[derive(Debug, Clone)]
pub struct ContextComposer {
    budget: usize,
}

impl ContextComposer {
    /// Create a composer for the given prompt-token budget.
    pub fn new(budget: usize) -> Self {
        Self {
            budget: budget.max(1),
        }
    }

    /// Create a composer from session budget numbers.
    pub fn for_budget(budget: TokenBudget) -> Self {
        Self::new(budget.available())
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Compose the outgoing message list for `turns`.
    pub fn compose(&self, turns: &[Turn], system_prompt: &str) -> ComposedContext {
        let system_prompt = system_prompt.trim();
        let system = (!system_prompt.is_empty()).then(|| OutgoingMessage::system(system_prompt));
        let system_tokens = system.as_ref().map_or(0, token::estimate_message_tokens);

        let (history, malformed_skipped) = Self::map_turns(turns);
        let mut groups = Self::group(history);

        let mut total: usize = system_tokens + groups.iter().map(|g| g.tokens).sum::<usize>();
        let mut drops = Vec::new();

        // ── Budget pruning (oldest first, newest group always kept) ────────
        let mut first = 0;
        let mut dropped = 0;
        let mut dropped_tokens = 0;
        while total > self.budget && groups.len() - first > 1 {
            let group = &groups[first];
            total -= group.tokens;
            dropped += group.messages.len();
            dropped_tokens += group.tokens;
            first += 1;
        }
        if dropped > 0 {
            drops.push(DropInfo {
                items_dropped: dropped,
                tokens_dropped: dropped_tokens,
                reason: "Oldest messages dropped to fit budget".into(),
            });
        }

        // ── Orphaned tool results at the head ─────────────────────────────
        let mut orphans = 0;
        let mut orphan_tokens = 0;
        while first < groups.len() && groups[first].orphan {
            let group = &groups[first];
            total -= group.tokens;
            orphans += group.messages.len();
            orphan_tokens += group.tokens;
            first += 1;
        }
        if orphans > 0 {
            drops.push(DropInfo {
                items_dropped: orphans,
                tokens_dropped: orphan_tokens,
                reason: "Tool results without their originating call dropped".into(),
            });
        }

        let mut messages = Vec::new();
        messages.extend(system);
        for group in groups.drain(first..) {
            messages.extend(group.messages);
        }

        if !drops.is_empty() {
            debug!(
                budget = self.budget,
                total_tokens = total,
                kept = messages.len(),
                "Pruned conversation history"
            );
        }

        ComposedContext {
            messages,
            metadata: CompositionMetadata {
                total_tokens: total,
                budget: self.budget,
                utilization_pct: (total as f32 / self.budget as f32) * 100.0,
                malformed_skipped,
                drops,
            },
        }
    }

    // ── Private helpers ───────────────────────────────────────────────────

    /// Map turns to wire messages, skipping what must not be sent.
    fn map_turns(turns: &[Turn]) -> (Vec<OutgoingMessage>, usize) {
        let placeholder = turns
            .iter()
            .rposition(|t| t.role == Role::Assistant)
            .filter(|&i| turns[i].is_empty_assistant());

        let mut messages = Vec::with_capacity(turns.len());
        let mut malformed = 0;

        for (index, turn) in turns.iter().enumerate() {
            let message = match turn.role {
                Role::Assistant if turn.is_empty_assistant() => {
                    if Some(index) != placeholder {
                        warn!(turn_id = %turn.id, "Skipping malformed assistant turn with no text and no tool calls");
                        malformed += 1;
                    }
                    continue;
                }
                Role::Assistant => OutgoingMessage::assistant(&turn.content, &turn.tool_calls),
                Role::Tool => match &turn.tool_call_id {
                    Some(call_id) => OutgoingMessage::tool(call_id, &turn.content),
                    None => {
                        warn!(turn_id = %turn.id, "Skipping tool turn without a call id");
                        malformed += 1;
                        continue;
                    }
                },
                Role::User => OutgoingMessage::user(&turn.content, turn.images.clone()),
                Role::System => {
                    debug!(turn_id = %turn.id, "System turn in history superseded by the persona prompt");
                    continue;
                }
            };
            messages.push(message);
        }

        (messages, malformed)
    }

    /// Attach each tool message to the message before it.
    fn group(messages: Vec<OutgoingMessage>) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        for message in messages {
            let tokens = token::estimate_message_tokens(&message);
            match groups.last_mut() {
                Some(group) if message.role == Role::Tool => {
                    group.tokens += tokens;
                    group.messages.push(message);
                }
                _ => {
                    let orphan = message.role == Role::Tool;
                    groups.push(Group {
                        messages: vec![message],
                        tokens,
                        orphan,
                    });
                }
            }
        }
        groups
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chatloop_core::message::{ImageAttachment, MessageToolCall};

    fn call(id: &str) -> MessageToolCall {
        MessageToolCall {
            id: id.into(),
            name: "lookup".into(),
            arguments: "{}".into(),
        }
    }

    fn assistant_calling(id: &str) -> Turn {
        let mut turn = Turn::assistant("");
        turn.tool_calls.push(call(id));
        turn
    }

    fn roles(messages: &[OutgoingMessage]) -> Vec<Role> {
        messages.iter().map(|m| m.role).collect()
    }

    #[test]
    fn empty_history_yields_only_system_prompt() {
        let composer = ContextComposer::new(1000);
        assert!(composer.compose(&[], "").messages.is_empty());

        let ctx = composer.compose(&[], "  Be helpful.  ");
        assert_eq!(ctx.messages.len(), 1);
        assert_eq!(ctx.messages[0].content.as_deref(), Some("Be helpful."));
    }

    #[test]
    fn maps_roles_in_order() {
        let turns = vec![
            Turn::user("What time is it?"),
            assistant_calling("call_1"),
            Turn::tool_result("call_1", "12:00"),
            Turn::assistant("It is noon."),
            Turn::user("Thanks"),
        ];
        let ctx = ContextComposer::new(10_000).compose(&turns, "sys");
        assert_eq!(
            roles(&ctx.messages),
            vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant, Role::User]
        );
        assert!(ctx.messages[2].content.is_none());
        assert_eq!(ctx.messages[2].tool_calls.as_ref().map(Vec::len), Some(1));
        assert_eq!(ctx.messages[3].tool_call_id.as_deref(), Some("call_1"));
        assert!(ctx.messages[3].tool_calls.is_none());
        assert!(ctx.messages[4].tool_calls.is_none());
    }

    #[test]
    fn drops_streaming_placeholder_silently() {
        let turns = vec![Turn::user("hi"), Turn::assistant_placeholder()];
        let ctx = ContextComposer::new(1000).compose(&turns, "");
        assert_eq!(roles(&ctx.messages), vec![Role::User]);
        assert_eq!(ctx.metadata.malformed_skipped, 0);
    }

    #[test]
    fn drops_malformed_assistant_turns() {
        let turns = vec![
            Turn::user("one"),
            Turn::assistant(""),
            Turn::user("two"),
            Turn::assistant("answer"),
        ];
        let ctx = ContextComposer::new(1000).compose(&turns, "");
        assert_eq!(roles(&ctx.messages), vec![Role::User, Role::User, Role::Assistant]);
        assert_eq!(ctx.metadata.malformed_skipped, 1);
    }

    #[test]
    fn no_assistant_message_is_ever_empty() {
        let turns = vec![
            Turn::user("a"),
            Turn::assistant("   "),
            assistant_calling("c1"),
            Turn::tool_result("c1", "r"),
            Turn::assistant_placeholder(),
        ];
        let ctx = ContextComposer::new(1000).compose(&turns, "");
        for msg in ctx.messages.iter().filter(|m| m.role == Role::Assistant) {
            assert!(msg.content.is_some() || msg.tool_calls.is_some());
        }
    }

    #[test]
    fn user_images_are_forwarded() {
        let image = ImageAttachment::new("image/jpeg", vec![0xFF, 0xD8]);
        let turns = vec![Turn::user_with_images("look", vec![image.clone()])];
        let ctx = ContextComposer::new(1000).compose(&turns, "");
        assert_eq!(ctx.messages[0].images, vec![image]);
    }

    #[test]
    fn prunes_oldest_and_keeps_system() {
        let long = "x".repeat(400); // 100 tokens each
        let turns = vec![
            Turn::user(long.clone()),
            Turn::assistant(long.clone()),
            Turn::user(long.clone()),
            Turn::assistant(long),
            Turn::user("latest"),
        ];
        let ctx = ContextComposer::new(150).compose(&turns, "system prompt");
        assert_eq!(ctx.messages[0].role, Role::System);
        assert_eq!(ctx.messages.last().unwrap().content.as_deref(), Some("latest"));
        assert_eq!(ctx.messages.len(), 3);
        assert_eq!(ctx.metadata.drops[0].items_dropped, 3);
        assert_eq!(ctx.metadata.drops[0].tokens_dropped, 300);
        assert!(ctx.metadata.total_tokens <= 150);

        let ctx = ContextComposer::new(50).compose(&turns, "system prompt");
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.metadata.drops[0].items_dropped, 4);
    }

    #[test]
    fn keeps_newest_message_even_over_budget() {
        let turns = vec![Turn::user("a".repeat(100)), Turn::user("b".repeat(4000))];
        let ctx = ContextComposer::new(1).compose(&turns, "sys");
        assert_eq!(ctx.messages.len(), 2);
        assert_eq!(ctx.messages[1].content.as_deref().map(str::len), Some(4000));
        assert!(ctx.metadata.total_tokens > 1);
    }

    #[test]
    fn pruning_drops_tool_results_with_their_call() {
        let turns = vec![
            Turn::user("x".repeat(400)),
            assistant_calling("c1"),
            Turn::tool_result("c1", "y".repeat(400)),
            Turn::user("latest question"),
        ];
        let ctx = ContextComposer::new(10).compose(&turns, "");
        assert_eq!(roles(&ctx.messages), vec![Role::User]);
        assert_eq!(ctx.messages[0].content.as_deref(), Some("latest question"));
    }

    #[test]
    fn history_starting_with_tool_result_is_cleaned() {
        let turns = vec![Turn::tool_result("gone", "stale"), Turn::user("hi")];
        let ctx = ContextComposer::new(1000).compose(&turns, "sys");
        assert_eq!(roles(&ctx.messages), vec![Role::System, Role::User]);
        assert_eq!(ctx.metadata.drops[0].items_dropped, 1);
    }

    #[test]
    fn tool_result_stays_with_its_call_when_newest() {
        let turns = vec![
            Turn::user("x".repeat(400)),
            assistant_calling("c1"),
            Turn::tool_result("c1", "result"),
            Turn::assistant_placeholder(),
        ];
        let ctx = ContextComposer::new(1).compose(&turns, "");
        assert_eq!(roles(&ctx.messages), vec![Role::Assistant, Role::Tool]);
    }

    #[test]
    fn pruning_invariants_hold_for_every_budget() {
        let turns = vec![
            Turn::user("first question ".repeat(10)),
            assistant_calling("c1"),
            Turn::tool_result("c1", "result one ".repeat(20)),
            Turn::assistant("intermediate answer ".repeat(5)),
            Turn::user("second question"),
            assistant_calling("c2"),
            Turn::tool_result("c2", "result two ".repeat(30)),
            Turn::assistant("final"),
            Turn::user("newest"),
        ];

        for budget in 1..=400 {
            for prompt in ["", "You are a helpful assistant."] {
                let ctx = ContextComposer::new(budget).compose(&turns, prompt);
                let last = ctx.messages.last().unwrap();
                assert_eq!(last.content.as_deref(), Some("newest"), "budget {budget}");

                let first_history = ctx.messages.iter().find(|m| m.role != Role::System).unwrap();
                assert_ne!(first_history.role, Role::Tool, "budget {budget}");
            }
        }
    }

    #[test]
    fn budget_available_never_zero() {
        assert_eq!(TokenBudget::new(8192, 2048).available(), 6144);
        assert_eq!(TokenBudget::new(1024, 4096).available(), 1);
        assert_eq!(ContextComposer::for_budget(TokenBudget::new(100, 40)).budget(), 60);
    }

    #[test]
    fn composition_is_deterministic() {
        let turns = vec![Turn::user("a"), Turn::assistant("b"), Turn::user("c")];
        let composer = ContextComposer::new(2);
        let first = composer.compose(&turns, "s");
        let second = composer.compose(&turns, "s");
        assert_eq!(first.messages, second.messages);
    }
}
