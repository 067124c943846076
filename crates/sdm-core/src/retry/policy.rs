use std::time::Duration;

/// High-level classification of a worker error for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out (connect/read), or HTTP 408.
    Timeout,
    /// Server asked us to slow down (429, 503).
    Throttled,
    /// Network-level failure (connection reset, DNS, short body).
    Connection,
    /// Retryable HTTP server error (5xx other than 503).
    Http5xx(u16),
    /// Not retryable: other 4xx, redirect loops, local I/O.
    Permanent,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff with caps: 100 ms doubling to a 3.2 s ceiling, at
/// most `max_retries` retries after the initial attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(3200),
        }
    }
}

impl RetryPolicy {
    /// Decide whether to retry after a failed attempt.
    ///
    /// `attempt` is 1-based (1 = the first attempt just failed). A
    /// `retry_after` hint from the server replaces the computed backoff but
    /// is still capped at `max_delay`.
    pub fn decide(
        &self,
        attempt: u32,
        kind: ErrorKind,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if !kind.is_retryable() || attempt > self.max_retries {
            return RetryDecision::NoRetry;
        }
        let delay = match retry_after {
            Some(hint) => hint.min(self.max_delay),
            None => {
                let exp = 1u32 << attempt.saturating_sub(1).min(8);
                self.base_delay.saturating_mul(exp).min(self.max_delay)
            }
        };
        RetryDecision::RetryAfter(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_for_permanent() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(1, ErrorKind::Permanent, None), RetryDecision::NoRetry);
    }

    #[test]
    fn backoff_doubles_from_100ms_and_caps_at_3200ms() {
        let p = RetryPolicy::default();
        let delays: Vec<Duration> = (1..=6)
            .map(|a| match p.decide(a, ErrorKind::Connection, None) {
                RetryDecision::RetryAfter(d) => d,
                RetryDecision::NoRetry => panic!("attempt {a} should retry"),
            })
            .collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[5], Duration::from_millis(3200));
    }

    #[test]
    fn stops_after_six_retries() {
        let p = RetryPolicy::default();
        assert!(matches!(
            p.decide(6, ErrorKind::Timeout, None),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(p.decide(7, ErrorKind::Timeout, None), RetryDecision::NoRetry);
    }

    #[test]
    fn retry_after_hint_overrides_backoff_but_is_capped() {
        let p = RetryPolicy::default();
        assert_eq!(
            p.decide(1, ErrorKind::Throttled, Some(Duration::from_secs(2))),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            p.decide(1, ErrorKind::Throttled, Some(Duration::from_secs(60))),
            RetryDecision::RetryAfter(Duration::from_millis(3200))
        );
    }
}
