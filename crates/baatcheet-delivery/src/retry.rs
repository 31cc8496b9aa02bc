//! Fixed-schedule retry policy.
//!
//! A delivery gets `max_attempts` tries in total. After the n-th failed
//! attempt the next one waits `backoff[n - 1]`; attempts past the end of the
//! list reuse the last entry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retry schedule for webhook deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySchedule {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Wait before each retry.
    pub backoff: Vec<Duration>,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![Duration::from_secs(1), Duration::from_secs(5), Duration::from_secs(25)],
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again at the given time.
    Retry {
        /// When the next attempt is due.
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop; the delivery has failed.
    GiveUp {
        /// Why no further attempt is made.
        reason: String,
    },
}

impl RetrySchedule {
    /// Wait after `attempts_made` failed attempts.
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let position = attempts_made.saturating_sub(1) as usize;
        self.backoff
            .get(position)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }

    /// Decides whether to retry after attempt number `attempts_made` failed
    /// at `failed_at`.
    pub fn decide(&self, attempts_made: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("gave up after {attempts_made} attempts"),
            };
        }

        let delay = chrono::Duration::from_std(self.delay_after(attempts_made))
            .unwrap_or_else(|_| chrono::Duration::zero());
        RetryDecision::Retry { next_attempt_at: failed_at + delay }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_schedule_waits_one_then_five_seconds() {
        let schedule = RetrySchedule::default();
        let now = Utc::now();

        assert_eq!(
            schedule.decide(1, now),
            RetryDecision::Retry { next_attempt_at: now + chrono::Duration::seconds(1) }
        );
        assert_eq!(
            schedule.decide(2, now),
            RetryDecision::Retry { next_attempt_at: now + chrono::Duration::seconds(5) }
        );
        assert!(matches!(schedule.decide(3, now), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn short_backoff_list_reuses_last_delay() {
        let schedule =
            RetrySchedule { max_attempts: 6, backoff: vec![Duration::from_secs(2), Duration::from_secs(7)] };

        assert_eq!(schedule.delay_after(1), Duration::from_secs(2));
        assert_eq!(schedule.delay_after(2), Duration::from_secs(7));
        assert_eq!(schedule.delay_after(5), Duration::from_secs(7));
    }

    #[test]
    fn empty_backoff_retries_immediately() {
        let schedule = RetrySchedule { max_attempts: 2, backoff: Vec::new() };
        let now = Utc::now();

        assert_eq!(schedule.decide(1, now), RetryDecision::Retry { next_attempt_at: now });
    }

    proptest! {
        #[test]
        fn never_retries_past_max_attempts(max_attempts in 1u32..10, attempts_made in 0u32..20) {
            let schedule = RetrySchedule { max_attempts, ..RetrySchedule::default() };
            let decision = schedule.decide(attempts_made, Utc::now());

            prop_assert_eq!(
                matches!(decision, RetryDecision::GiveUp { .. }),
                attempts_made >= max_attempts
            );
        }

        #[test]
        fn retries_are_never_scheduled_in_the_past(attempts_made in 1u32..3) {
            let schedule = RetrySchedule::default();
            let now = Utc::now();

            if let RetryDecision::Retry { next_attempt_at } = schedule.decide(attempts_made, now) {
                prop_assert!(next_attempt_at > now);
            }
        }
    }
}
