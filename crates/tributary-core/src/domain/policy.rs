//! Redelivery policy: decides what happens to an item whose handler failed.
//!
//! The policy is a pure function of the attempt number. Applying the decision
//! (nak with delay, or term + dead-letter) is the consumer's job.

use std::time::Duration;

/// The next action for a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Redeliver after the given delay.
    Retry(Duration),

    /// Give up: remove from the active queue and report.
    DeadLetter,
}

/// Bounded redelivery with per-attempt backoff.
///
/// `max_deliver` is the total number of deliveries an item may get (the first
/// delivery included). `backoff[n - 1]` is the delay after failed attempt `n`,
/// so at most `max_deliver - 1` entries are ever read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    max_deliver: u32,
    backoff: Vec<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("max_deliver must be at least 1")]
    ZeroMaxDeliver,

    #[error("backoff multiplier must be finite and positive, got {0}")]
    InvalidMultiplier(String),

    #[error("backoff delay after attempt {attempt} does not fit in a Duration")]
    BackoffOverflow { attempt: u32 },
}

impl RedeliveryPolicy {
    pub fn new(max_deliver: u32, backoff: Vec<Duration>) -> Result<Self, PolicyError> {
        if max_deliver == 0 {
            return Err(PolicyError::ZeroMaxDeliver);
        }
        Ok(Self {
            max_deliver,
            backoff,
        })
    }

    /// Exponential backoff: delay after attempt `n` is `base * multiplier^(n - 1)`.
    ///
    /// Example with base=2s, multiplier=2.0, max_deliver=5: 2s, 4s, 8s, 16s.
    pub fn exponential(
        max_deliver: u32,
        base: Duration,
        multiplier: f64,
    ) -> Result<Self, PolicyError> {
        if max_deliver == 0 {
            return Err(PolicyError::ZeroMaxDeliver);
        }
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(PolicyError::InvalidMultiplier(multiplier.to_string()));
        }

        let base_secs = base.as_secs_f64();
        let backoff = (1..max_deliver)
            .map(|attempt| {
                let secs = base_secs * multiplier.powi((attempt - 1) as i32);
                Duration::try_from_secs_f64(secs)
                    .map_err(|_| PolicyError::BackoffOverflow { attempt })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(max_deliver, backoff)
    }

    pub fn max_deliver(&self) -> u32 {
        self.max_deliver
    }

    pub fn backoff(&self) -> &[Duration] {
        &self.backoff
    }

    /// Delay to apply after failed attempt `attempt` (1-indexed).
    ///
    /// Attempts beyond the configured list reuse the last delay; an empty list
    /// means immediate redelivery.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Decide the next action after attempt `attempt` failed.
    pub fn next_action(&self, attempt: u32) -> NextAction {
        if attempt >= self.max_deliver {
            NextAction::DeadLetter
        } else {
            NextAction::Retry(self.delay_after(attempt))
        }
    }
}

impl Default for RedeliveryPolicy {
    /// Three deliveries, one minute then five minutes apart.
    fn default() -> Self {
        Self {
            max_deliver: 3,
            backoff: vec![Duration::from_secs(60), Duration::from_secs(300)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[rstest]
    #[case(1, NextAction::Retry(secs(60)))]
    #[case(2, NextAction::Retry(secs(300)))]
    #[case(3, NextAction::DeadLetter)]
    #[case(4, NextAction::DeadLetter)]
    #[case(100, NextAction::DeadLetter)]
    fn default_policy_decisions(#[case] attempt: u32, #[case] expected: NextAction) {
        assert_eq!(RedeliveryPolicy::default().next_action(attempt), expected);
    }

    #[test]
    fn retries_below_max_deliver_use_the_matching_delay() {
        let backoff = vec![secs(1), secs(2), secs(3), secs(4)];
        let policy = RedeliveryPolicy::new(5, backoff.clone()).unwrap();
        for attempt in 1..5 {
            assert_eq!(
                policy.next_action(attempt),
                NextAction::Retry(backoff[attempt as usize - 1])
            );
        }
        assert_eq!(policy.next_action(5), NextAction::DeadLetter);
    }

    #[test]
    fn short_backoff_list_reuses_last_delay() {
        let policy = RedeliveryPolicy::new(6, vec![secs(10), secs(20)]).unwrap();
        assert_eq!(policy.next_action(1), NextAction::Retry(secs(10)));
        assert_eq!(policy.next_action(2), NextAction::Retry(secs(20)));
        assert_eq!(policy.next_action(3), NextAction::Retry(secs(20)));
        assert_eq!(policy.next_action(5), NextAction::Retry(secs(20)));
        assert_eq!(policy.next_action(6), NextAction::DeadLetter);
    }

    #[test]
    fn empty_backoff_redelivers_immediately() {
        let policy = RedeliveryPolicy::new(3, vec![]).unwrap();
        assert_eq!(policy.next_action(1), NextAction::Retry(Duration::ZERO));
    }

    #[test]
    fn single_delivery_dead_letters_on_first_failure() {
        let policy = RedeliveryPolicy::new(1, vec![secs(5)]).unwrap();
        assert_eq!(policy.next_action(1), NextAction::DeadLetter);
    }

    #[test]
    fn zero_max_deliver_is_rejected() {
        assert_eq!(
            RedeliveryPolicy::new(0, vec![]),
            Err(PolicyError::ZeroMaxDeliver)
        );
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RedeliveryPolicy::exponential(5, secs(2), 2.0).unwrap();
        assert_eq!(policy.backoff(), &[secs(2), secs(4), secs(8), secs(16)]);
        assert_eq!(policy.next_action(4), NextAction::Retry(secs(16)));
        assert_eq!(policy.next_action(5), NextAction::DeadLetter);
    }

    #[rstest]
    #[case(80, secs(1), 2.0, PolicyError::BackoffOverflow { attempt: 65 })]
    #[case(3, secs(1), -1.0, PolicyError::InvalidMultiplier("-1".to_string()))]
    #[case(3, secs(1), 0.0, PolicyError::InvalidMultiplier("0".to_string()))]
    #[case(3, secs(1), f64::NAN, PolicyError::InvalidMultiplier("NaN".to_string()))]
    #[case(3, secs(1), f64::INFINITY, PolicyError::InvalidMultiplier("inf".to_string()))]
    #[case(0, secs(1), 2.0, PolicyError::ZeroMaxDeliver)]
    fn exponential_rejects_unusable_parameters(
        #[case] max_deliver: u32,
        #[case] base: Duration,
        #[case] multiplier: f64,
        #[case] expected: PolicyError,
    ) {
        assert_eq!(
            RedeliveryPolicy::exponential(max_deliver, base, multiplier),
            Err(expected)
        );
    }

    #[test]
    fn exponential_allows_shrinking_delays() {
        let policy = RedeliveryPolicy::exponential(3, secs(8), 0.5).unwrap();
        assert_eq!(policy.backoff(), &[secs(8), secs(4)]);
    }
}
