//! Adaptive commit cadence.
//!
//! Committing every fragment floods the consumer; committing too rarely
//! makes the output stutter. The scheduler picks a flush interval and a
//! buffer threshold from how much text has streamed so far, then stretches
//! both when commits have been slow to land.
//!
//! | streamed chars | interval | buffer |
//! |---|---|---|
//! | < 2 000 | 50 ms | 64 |
//! | < 8 000 | 100 ms | 256 |
//! | < 24 000 | 150 ms | 512 |
//! | otherwise | 250 ms | 1 024 |
//!
//! The worst observed commit latency scales both numbers by 1.0–4.0×, then
//! they are clamped to [`MAX_FLUSH_INTERVAL`] and [`MAX_BUFFER_CHARS`].

use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on the flush interval.
pub const MAX_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound on the buffer threshold.
pub const MAX_BUFFER_CHARS: usize = 4096;

/// The scheduler's current knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTuning {
    /// Longest time buffered text may wait.
    pub interval: Duration,
    /// Buffered characters that force a commit.
    pub max_buffer_chars: usize,
    /// Worst commit latency seen so far.
    pub max_commit_latency: Duration,
}

impl FlushTuning {
    /// Tuning for a stream that has produced `total_chars` so far.
    pub fn for_progress(total_chars: usize, max_commit_latency: Duration) -> Self {
        let (interval_ms, buffer) = base_step(total_chars);
        let factor = backpressure_factor(max_commit_latency);

        let interval = Duration::from_millis((interval_ms as f64 * factor).round() as u64);
        let max_buffer_chars = (buffer as f64 * factor).round() as usize;

        Self {
            interval: interval.min(MAX_FLUSH_INTERVAL),
            max_buffer_chars: max_buffer_chars.min(MAX_BUFFER_CHARS),
            max_commit_latency,
        }
    }
}

impl Default for FlushTuning {
    fn default() -> Self {
        Self::for_progress(0, Duration::ZERO)
    }
}

fn base_step(total_chars: usize) -> (u64, usize) {
    match total_chars {
        0..2_000 => (50, 64),
        2_000..8_000 => (100, 256),
        8_000..24_000 => (150, 512),
        _ => (250, 1024),
    }
}

fn backpressure_factor(latency: Duration) -> f64 {
    match latency.as_millis() {
        0..4 => 1.0,
        4..16 => 1.5,
        16..50 => 2.0,
        50..100 => 3.0,
        _ => 4.0,
    }
}

/// Decides when buffered text is committed.
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    total_chars: usize,
    buffered_chars: usize,
    last_flush: Instant,
    tuning: FlushTuning,
}

impl FlushScheduler {
    pub fn new(now: Instant) -> Self {
        Self {
            total_chars: 0,
            buffered_chars: 0,
            last_flush: now,
            tuning: FlushTuning::default(),
        }
    }

    pub fn tuning(&self) -> FlushTuning {
        self.tuning
    }

    pub fn buffered_chars(&self) -> usize {
        self.buffered_chars
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    /// Account for newly buffered text.
    pub fn record(&mut self, chars: usize) {
        if chars == 0 {
            return;
        }
        self.total_chars += chars;
        self.buffered_chars += chars;
        self.tuning = FlushTuning::for_progress(self.total_chars, self.tuning.max_commit_latency);
    }

    /// Whether buffered text should be committed now.
    pub fn should_flush(&self, now: Instant) -> bool {
        self.buffered_chars > 0
            && (self.buffered_chars >= self.tuning.max_buffer_chars
                || now.saturating_duration_since(self.last_flush) >= self.tuning.interval)
    }

    /// When the buffered text becomes due, if anything is buffered.
    pub fn next_deadline(&self) -> Option<Instant> {
        (self.buffered_chars > 0).then(|| self.last_flush + self.tuning.interval)
    }

    /// Account for a finished commit and how long it took to land.
    pub fn record_commit(&mut self, now: Instant, latency: Duration) {
        self.buffered_chars = 0;
        self.last_flush = now;
        let worst = self.tuning.max_commit_latency.max(latency);
        self.tuning = FlushTuning::for_progress(self.total_chars, worst);
    }
}
