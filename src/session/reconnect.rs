//! Reconnection with capped exponential backoff

use std::time::Duration;

/// Reconnection policy for failed connection attempts
///
/// Controls how many times a failed attempt is retried and how long to wait
/// between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts
    pub max_attempts: u32,
    /// Base delay between attempts (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Compute the delay before retry number `attempt` (zero-based)
    ///
    /// `min(base_delay * 2^attempt, max_delay)`, without jitter so a
    /// caller-visible countdown matches the actual wait.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Attempt counter owned by the session controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    attempt: u32,
}

impl ReconnectState {
    /// Reconnect attempts made since the last successful open
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Claim the next retry, returning its zero-based index and delay
    ///
    /// Returns `None` once the budget is spent.
    pub fn next_retry(&mut self, policy: &ReconnectPolicy) -> Option<(u32, Duration)> {
        if self.attempt >= policy.max_attempts {
            return None;
        }
        let index = self.attempt;
        self.attempt += 1;
        Some((index, policy.delay_for_attempt(index)))
    }

    /// Back to zero after a successful open or an explicit caller reconnect
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn budget_is_spent_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        let mut state = ReconnectState::default();

        let delays: Vec<_> = std::iter::from_fn(|| state.next_retry(&policy))
            .map(|(_, d)| d)
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(state.attempt(), 3);
        assert!(state.next_retry(&policy).is_none());
    }

    #[test]
    fn reset_restores_budget() {
        let policy = ReconnectPolicy::default();
        let mut state = ReconnectState::default();
        while state.next_retry(&policy).is_some() {}

        state.reset();
        assert_eq!(state.next_retry(&policy), Some((0, Duration::from_secs(1))));
    }

    #[test]
    fn zero_attempts_never_retries() {
        let policy = ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        };
        assert!(ReconnectState::default().next_retry(&policy).is_none());
    }
}
