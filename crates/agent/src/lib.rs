//! The exchange engine — the heart of chatloop.
//!
//! One exchange follows a **Compose → Stream → Tool** cycle:
//!
//! 1. **Compose** the request context from the live turn history under the
//!    session token budget
//! 2. **Stream** the response through the delta classifier, committing
//!    visible and reasoning text in adaptive batches
//! 3. **If the model asks for a tool**: execute it, append the result and
//!    compose again
//! 4. **Otherwise**: the exchange is done
//!
//! The loop stops on a rejected tool, on cancellation, or once
//! `max_attempts` requests have been issued.

pub mod context;
pub mod loop_runner;
pub mod stream;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::{ComposedContext, CompositionMetadata, ContextComposer, DropInfo, TokenBudget};
pub use loop_runner::{
    ExchangeOutcome, ExchangeReport, SharedConversation, ToolLoop, final_answer, is_rejected,
};
pub use stream::{
    ClassifierState, DeltaClassifier, FlushScheduler, FlushTuning, PendingCommit, Segment,
    SegmentKind, StreamSession,
};
pub use stream_event::ExchangeEvent;
