use crate::inference::GenerationEvent;
use std::time::{Duration, Instant};

/// Events accumulated since the previous flush
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flush {
    /// Text increments concatenated in arrival order
    pub text: String,
    /// Throughput from a completion record in this batch
    pub tokens_per_second: Option<f64>,
    pub is_final: bool,
}

/// Rate-limits delivery of streamed text.
///
/// A batch is due once `interval` has passed since the previous flush, or as soon as it holds
/// the completion record.
#[derive(Debug)]
pub struct FlushBatcher {
    interval: Duration,
    last_flush: Instant,
    pending: Flush,
    has_pending: bool,
}

impl FlushBatcher {
    /// `start` counts as the previous flush
    #[must_use]
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            last_flush: start,
            pending: Flush::default(),
            has_pending: false,
        }
    }

    /// Add an event to the current batch
    pub fn push(&mut self, event: GenerationEvent) {
        self.has_pending = true;
        match event {
            GenerationEvent::Chunk(text) => self.pending.text.push_str(&text),
            GenerationEvent::Info { tokens_per_second } => {
                self.pending.tokens_per_second = Some(tokens_per_second);
                self.pending.is_final = true;
            }
        }
    }

    #[must_use]
    pub const fn has_pending(&self) -> bool {
        self.has_pending
    }

    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.has_pending
            && (self.pending.is_final || now.saturating_duration_since(self.last_flush) >= self.interval)
    }

    /// Take the current batch and restart the interval at `now`
    pub fn take(&mut self, now: Instant) -> Flush {
        self.last_flush = now;
        self.has_pending = false;
        std::mem::take(&mut self.pending)
    }
}
