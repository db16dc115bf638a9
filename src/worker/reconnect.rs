//! Worker connection state machine and reconnect policy.
//!
//! ```text
//! Disconnected ─► Connecting ─► Registered ─► Disconnected ─► Connecting ...
//!                     │
//!                     └─ after max consecutive failures ─► GaveUp
//! ```

use std::time::Duration;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Default bound on consecutive failed attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Connection state of a worker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Opening the control connection.
    Connecting {
        /// 1-based attempt number since the last successful connection.
        attempt: u32,
    },
    /// Connected and registration sent.
    Registered,
    /// Stopped after too many consecutive failures.
    GaveUp,
}

impl ConnectionState {
    /// Check if the worker can currently receive jobs.
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered)
    }
}

/// Fixed-delay reconnect policy with a bounded number of consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before each reconnect attempt.
    pub delay: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Counts consecutive failures against a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    /// Start with no failures.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Number of the next attempt (1-based).
    pub fn next_attempt(&self) -> u32 {
        self.failures + 1
    }

    /// Record a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record a failed attempt. Returns the delay before the next attempt, or
    /// `None` when the bound is reached.
    pub fn fail(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            None
        } else {
            Some(self.policy.delay)
        }
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before reconnecting after a session ended.
    pub fn delay(&self) -> Duration {
        self.policy.delay
    }
}
