//! Retry policy for ephemeral tunnel acquisition.

use std::time::Duration;

/// Bounded retry policy with a fixed backoff between attempts.
///
/// Each attempt polls the tunnel output `polls_per_attempt` times,
/// `poll_interval` apart. A rate-limited or silent attempt is followed by
/// `backoff` unless it was the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquirePolicy {
    /// Tunnel launches before giving up.
    pub max_attempts: u32,
    /// Delay before each check of the captured output.
    pub poll_interval: Duration,
    /// Checks per attempt before the attempt times out.
    pub polls_per_attempt: u32,
    /// Fixed pause between a failed attempt and the next launch.
    pub backoff: Duration,
    /// Lines of captured output logged after the last failed attempt.
    pub diagnostic_lines: usize,
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            poll_interval: Duration::from_secs(1),
            polls_per_attempt: 90,
            backoff: Duration::from_secs(120),
            diagnostic_lines: 20,
        }
    }
}

impl AcquirePolicy {
    /// Longest time a single attempt may take.
    pub fn attempt_window(&self) -> Duration {
        self.poll_interval * self.polls_per_attempt
    }

    /// Whether another launch follows attempt number `attempt` (1-indexed).
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
