//! Incremental decoding of a streamed response.
//!
//! [`DeltaClassifier`] splits fragments into visible and reasoning text,
//! [`FlushScheduler`] decides when buffered text is committed, and
//! [`StreamSession`] ties the two together for one request attempt.

pub mod classifier;
pub mod flush;
pub mod session;

pub use classifier::{ClassifierState, DeltaClassifier, Segment, SegmentKind};
pub use flush::{FlushScheduler, FlushTuning, MAX_BUFFER_CHARS, MAX_FLUSH_INTERVAL};
pub use session::{PendingCommit, StreamSession};
