//! Linear retry backoff with a ceiling.

use std::time::Duration;

/// Retry policy of the acquisition queue
///
/// After the `n`-th consecutive failure the task is re-submitted after
/// `n * base_interval`, as long as `n <= max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_interval: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(base_interval: Duration, max_retries: u32) -> Self {
        Self {
            base_interval,
            max_retries,
        }
    }

    /// Delay before the next attempt, `None` once the ceiling is exceeded.
    ///
    /// `retry_count` is the failure count including the one just observed.
    pub fn next_delay(&self, retry_count: u32) -> Option<Duration> {
        if retry_count == 0 || retry_count > self.max_retries {
            return None;
        }
        Some(self.base_interval.saturating_mul(retry_count))
    }

    /// Whether `retry_count` failures exhaust the policy
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(Duration::from_secs(60), 10);

        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(60)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(120)));
        assert_eq!(policy.next_delay(10), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_ceiling() {
        let policy = RetryPolicy::new(Duration::from_secs(60), 10);

        assert!(!policy.is_exhausted(10));
        assert!(policy.is_exhausted(11));
        assert_eq!(policy.next_delay(11), None);
    }

    #[test]
    fn test_zero_retries() {
        let policy = RetryPolicy::new(Duration::from_secs(60), 0);

        assert_eq!(policy.next_delay(1), None);
        assert!(policy.is_exhausted(1));
    }
}
