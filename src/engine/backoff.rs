//! Adaptive poll interval for the processor loop.
//!
//! While work keeps arriving the loop does not sleep at all. Each empty poll
//! grows the wait geometrically up to a ceiling; once the queue has been
//! quiet for longer than the inactivity threshold the wait jumps straight to
//! the inactive interval instead of climbing there.

use std::time::Duration;

use tokio::time::Instant;

use super::ProcessorConfig;

#[derive(Debug, Clone)]
pub struct PollBackoff {
    min_wait: Duration,
    max_wait: Duration,
    factor: f64,
    inactivity_threshold: Duration,
    inactive_wait: Duration,
    current: Duration,
    last_activity: Instant,
}

impl PollBackoff {
    pub fn new(config: &ProcessorConfig, now: Instant) -> Self {
        Self {
            min_wait: config.min_poll_wait,
            max_wait: config.max_poll_wait,
            factor: config.backoff_factor,
            inactivity_threshold: config.inactivity_threshold,
            inactive_wait: config.inactive_poll_wait,
            current: config.min_poll_wait,
            last_activity: now,
        }
    }

    /// Wait computed by the last call to [`on_idle`](Self::on_idle).
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// How long since work was last found.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Work was found: back to the minimum wait.
    pub fn on_work(&mut self, now: Instant) {
        self.current = self.min_wait;
        self.last_activity = now;
    }

    /// Nothing was found: compute the next wait.
    pub fn on_idle(&mut self, now: Instant) -> Duration {
        self.current = if self.idle_for(now) < self.inactivity_threshold {
            self.current.mul_f64(self.factor).min(self.max_wait)
        } else {
            self.inactive_wait
        };
        self.current
    }

    /// Drop back to the minimum without recording activity (used while
    /// draining so the loop notices an empty queue quickly).
    pub fn reset_to_min(&mut self) {
        self.current = self.min_wait;
    }
}
