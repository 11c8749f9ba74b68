//! Per-attempt streaming state: classify, buffer, decide when to commit.

use super::classifier::{DeltaClassifier, SegmentKind};
use super::flush::{FlushScheduler, FlushTuning};
use std::time::Duration;
use tokio::time::Instant;

/// Classified text ready to be written into the assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingCommit {
    pub visible: String,
    pub reasoning: String,
}

impl PendingCommit {
    pub fn is_empty(&self) -> bool {
        self.visible.is_empty() && self.reasoning.is_empty()
    }
}

/// Classifier plus flush scheduler for one streamed response.
///
/// Fragments go in through [`push_fragment`](Self::push_fragment); commits
/// come out whenever the scheduler says the buffer is due. The caller
/// reports back how long each commit took with
/// [`record_commit`](Self::record_commit).
#[derive(Debug)]
pub struct StreamSession {
    classifier: DeltaClassifier,
    scheduler: FlushScheduler,
    buffer: PendingCommit,
}

impl StreamSession {
    pub fn new(open_marker: &str, close_marker: &str, now: Instant) -> Self {
        Self {
            classifier: DeltaClassifier::new(open_marker, close_marker),
            scheduler: FlushScheduler::new(now),
            buffer: PendingCommit::default(),
        }
    }

    /// Classify a fragment; returns a commit if one is due.
    pub fn push_fragment(&mut self, fragment: &str, now: Instant) -> Option<PendingCommit> {
        for segment in self.classifier.feed(fragment) {
            self.scheduler.record(segment.text.chars().count());
            match segment.kind {
                SegmentKind::Visible => self.buffer.visible.push_str(&segment.text),
                SegmentKind::Reasoning => self.buffer.reasoning.push_str(&segment.text),
            }
        }
        self.take_due(now)
    }

    /// Returns the buffered text if the scheduler says it is due.
    pub fn take_due(&mut self, now: Instant) -> Option<PendingCommit> {
        if self.scheduler.should_flush(now) {
            self.take()
        } else {
            None
        }
    }

    /// Force out everything, including a held-back partial marker.
    pub fn finish(&mut self) -> Option<PendingCommit> {
        if let Some(segment) = self.classifier.finish() {
            self.scheduler.record(segment.text.chars().count());
            match segment.kind {
                SegmentKind::Visible => self.buffer.visible.push_str(&segment.text),
                SegmentKind::Reasoning => self.buffer.reasoning.push_str(&segment.text),
            }
        }
        self.take()
    }

    /// When buffered text becomes due, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn record_commit(&mut self, now: Instant, latency: Duration) {
        self.scheduler.record_commit(now, latency);
    }

    pub fn tuning(&self) -> FlushTuning {
        self.scheduler.tuning()
    }

    pub fn in_reasoning(&self) -> bool {
        self.classifier.in_reasoning()
    }

    fn take(&mut self) -> Option<PendingCommit> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }
}
