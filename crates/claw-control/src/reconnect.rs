//! Reconnection backoff.
//!
//! The delay starts at a floor, grows geometrically on each failed attempt,
//! and is capped. It only returns to the floor after a fully authenticated
//! handshake, never on a bare transport open.

use std::time::Duration;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect of a failure streak, in ms.
    pub floor_ms: f64,
    /// Upper bound on the delay, in ms.
    pub cap_ms: f64,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            floor_ms: 800.0,
            cap_ms: 15_000.0,
            multiplier: 1.7,
        }
    }
}

impl ReconnectPolicy {
    /// Delay that follows `prev_ms` in a failure streak.
    #[must_use]
    pub fn next(&self, prev_ms: f64) -> f64 {
        (prev_ms * self.multiplier).min(self.cap_ms).max(self.floor_ms)
    }
}

/// Running backoff state for one client.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current_ms: f64,
}

impl Backoff {
    /// Start at the policy floor.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_ms: policy.floor_ms,
        }
    }

    /// Delay the next reconnect would wait, in ms.
    #[must_use]
    pub fn current_ms(&self) -> f64 {
        self.current_ms
    }

    /// Take the current delay and grow it for the following attempt.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = self.policy.next(delay);
        Duration::from_secs_f64(delay / 1000.0)
    }

    /// Return to the floor.
    pub fn reset(&mut self) {
        self.current_ms = self.policy.floor_ms;
    }
}
