//! Pipeline adapter: decides an event's fate and records the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::event::EventFields;
use crate::metrics::ThrottleMetrics;
use crate::ratelimit::LimiterPool;

/// What the pipeline should do with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Throttle,
}

impl Decision {
    pub fn is_admitted(self) -> bool {
        self == Decision::Admit
    }
}

/// Runs each event through the limiter pool and the throttle metrics.
pub struct Processor {
    limiter: Arc<LimiterPool>,
    metrics: ThrottleMetrics,
    /// Events throttled since the last admitted one
    throttled_streak: AtomicU64,
}

impl Processor {
    pub fn new(limiter: Arc<LimiterPool>, metrics: ThrottleMetrics) -> Self {
        Self {
            limiter,
            metrics,
            throttled_streak: AtomicU64::new(0),
        }
    }

    /// Decide `event` and count it.
    pub fn process<E: EventFields + ?Sized>(&self, event: &E) -> Decision {
        if self.limiter.allow(event) {
            self.throttled_streak.store(0, Ordering::Relaxed);
            self.metrics.observe(event, false);
            Decision::Admit
        } else {
            self.throttled_streak.fetch_add(1, Ordering::Relaxed);
            self.metrics.observe(event, true);
            Decision::Throttle
        }
    }

    pub fn throttled_streak(&self) -> u64 {
        self.throttled_streak.load(Ordering::Relaxed)
    }

    pub fn limiter(&self) -> &Arc<LimiterPool> {
        &self.limiter
    }

    pub fn metrics(&self) -> &ThrottleMetrics {
        &self.metrics
    }
}
