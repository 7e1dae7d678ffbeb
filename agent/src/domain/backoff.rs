//! Exponential backoff for store unavailability.
//!
//! The caller passes `now` in, so the schedule is deterministic under a
//! paused or virtual clock.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Errors persisting longer than this make the component unhealthy.
    pub give_up_after: Duration,
}

/// What the caller should do after a failed store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    Retry(Duration),
    Unhealthy { failing_for: Duration },
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    next_delay: Duration,
    failing_since: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            next_delay: policy.initial,
            failing_since: None,
        }
    }

    pub fn on_failure(&mut self, now: Instant) -> BackoffStep {
        let since = *self.failing_since.get_or_insert(now);
        let failing_for = now.saturating_duration_since(since);
        if failing_for >= self.policy.give_up_after {
            return BackoffStep::Unhealthy { failing_for };
        }
        let delay = self.next_delay;
        self.next_delay = (self.next_delay * 2).min(self.policy.max);
        BackoffStep::Retry(delay)
    }

    pub fn on_success(&mut self) {
        self.next_delay = self.policy.initial;
        self.failing_since = None;
    }

    pub fn is_failing(&self) -> bool {
        self.failing_since.is_some()
    }
}
