use chrono::{DateTime, Duration, Utc};

use crate::types::MAX_MENTION_CHECKS;

/// Bounded retry budget with exponential backoff, shared by mention verification and token refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_MENTION_CHECKS,
            base_delay: Duration::minutes(30),
            max_delay: Duration::hours(4),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failed_attempts` consecutive failures.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::zero();
        }
        let exponent = (failed_attempts - 1).min(16);
        let factor = 1_i32 << exponent;
        let delay = self.base_delay * factor;
        delay.min(self.max_delay)
    }

    /// Earliest instant another attempt is allowed.
    pub fn next_attempt_at(
        &self,
        last_attempt_at: Option<DateTime<Utc>>,
        failed_attempts: u32,
    ) -> Option<DateTime<Utc>> {
        last_attempt_at.map(|last| last + self.backoff(failed_attempts))
    }

    /// Returns `true` when an attempt may run at `now`.
    pub fn is_due(
        &self,
        last_attempt_at: Option<DateTime<Utc>>,
        failed_attempts: u32,
        now: DateTime<Utc>,
    ) -> bool {
        match self.next_attempt_at(last_attempt_at, failed_attempts) {
            Some(next) => now >= next,
            None => true,
        }
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::zero());
        assert_eq!(policy.backoff(1), Duration::minutes(30));
        assert_eq!(policy.backoff(2), Duration::hours(1));
        assert_eq!(policy.backoff(3), Duration::hours(2));
        assert_eq!(policy.backoff(4), Duration::hours(4));
        assert_eq!(policy.backoff(40), Duration::hours(4));
    }

    #[test]
    fn due_after_backoff_elapsed() {
        let policy = RetryPolicy::default();
        let last = Utc::now();
        assert!(policy.is_due(None, 0, last));
        assert!(!policy.is_due(Some(last), 1, last + Duration::minutes(29)));
        assert!(policy.is_due(Some(last), 1, last + Duration::minutes(30)));
    }

    #[test]
    fn exhausted_at_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }
}
