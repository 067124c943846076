//! Retry loop: run a closure until success, non-retryable error, or exhaustion.

use super::classify;
use super::error::WorkerError;
use super::policy::{RetryDecision, RetryPolicy};

/// Runs `f` until it succeeds or the policy says stop. Between attempts the
/// worker thread sleeps for the backoff duration, unless `interrupted`
/// returns true (pause/cancel), in which case the last error is returned so
/// the caller can inspect its flags.
pub fn run_with_retry<T, F, I>(policy: &RetryPolicy, mut interrupted: I, mut f: F) -> Result<T, WorkerError>
where
    F: FnMut() -> Result<T, WorkerError>,
    I: FnMut() -> bool,
{
    let mut attempt = 1u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if interrupted() {
                    return Err(e);
                }
                let kind = classify::classify(&e);
                let retry_after = match &e {
                    WorkerError::Http { retry_after, .. } => *retry_after,
                    _ => None,
                };
                match policy.decide(attempt, kind, retry_after) {
                    RetryDecision::NoRetry => return Err(e),
                    RetryDecision::RetryAfter(d) => {
                        tracing::debug!(attempt, delay_ms = d.as_millis() as u64, error = %e, "retrying segment");
                        std::thread::sleep(d);
                        attempt += 1;
                    }
                }
            }
        }
    }
}
