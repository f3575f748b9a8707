use crate::clock::Clock;
use log::debug;
use std::time::Duration;

/// Bounded retry: `max_attempts` tries with a fixed `delay` between them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Longest time a fully failing `retry` may block the caller.
    pub fn worst_case(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

/// Call `op` until it yields a value, at most `policy.max_attempts` times.
///
/// `op` receives the 1-based attempt number. Returns `None` once the budget is
/// spent or the clock reports cancellation; there is no sleep after the final
/// attempt.
pub fn retry<T, F>(clock: &dyn Clock, policy: RetryPolicy, mut op: F) -> Option<T>
where
    F: FnMut(u32) -> Option<T>,
{
    for attempt in 1..=policy.max_attempts {
        if let Some(value) = op(attempt) {
            return Some(value);
        }
        if attempt == policy.max_attempts || clock.cancelled() {
            break;
        }
        debug!(
            "attempt {attempt}/{} failed, retrying in {:?}",
            policy.max_attempts, policy.delay
        );
        clock.sleep(policy.delay);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_success_on_last_attempt() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::new(30, Duration::from_secs(1));
        let mut calls = 0;
        let value = retry(&clock, policy, |attempt| {
            calls += 1;
            (attempt == 30).then_some(1234.5)
        });
        assert_eq!(value, Some(1234.5));
        assert_eq!(calls, 30);
        assert_eq!(clock.elapsed(), Duration::from_secs(29));
    }

    #[test]
    fn test_budget_exhausted() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::new(30, Duration::from_secs(1));
        let mut calls = 0;
        let value: Option<f64> = retry(&clock, policy, |_| {
            calls += 1;
            None
        });
        assert_eq!(value, None);
        assert_eq!(calls, 30);
        assert_eq!(clock.elapsed(), policy.worst_case());
    }

    #[test]
    fn test_first_success_does_not_sleep() {
        let clock = ManualClock::new();
        let value = retry(&clock, RetryPolicy::new(5, Duration::from_secs(1)), Some);
        assert_eq!(value, Some(1));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_cancellation_stops_retrying() {
        let clock = ManualClock::new();
        clock.cancel_at(Duration::from_secs(3));
        let mut calls = 0;
        let value: Option<()> = retry(&clock, RetryPolicy::new(30, Duration::from_secs(1)), |_| {
            calls += 1;
            None
        });
        assert_eq!(value, None);
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(1)).max_attempts, 1);
    }
}
