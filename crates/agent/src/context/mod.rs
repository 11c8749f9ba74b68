//! Request context composition.
//!
//! Turns the live history into the outgoing message list for one attempt:
//!
//! | Step | Rule |
//! |------|------|
//! | 1. System | Persona prompt first, never pruned |
//! | 2. History | Turns mapped in order; placeholder and malformed turns left out |
//! | 3. Budget | Oldest history dropped first; newest message always kept |
//! | 4. Cleanup | Leading orphaned tool results dropped |

pub mod composer;
pub mod token;

pub use composer::{ComposedContext, CompositionMetadata, ContextComposer, DropInfo, TokenBudget};
