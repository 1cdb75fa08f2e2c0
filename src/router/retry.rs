//! Bounded retry with linear backoff
//!
//! Used for cross-context requests whose target may not be attached yet.
//! After failed attempt `n` the caller waits `n × base_delay` before trying
//! again; once the attempts run out the result is [`RetryOutcome::Unavailable`]
//! rather than an error.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Retry schedule for a cross-context request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,

    /// Delay unit; the wait after attempt `n` is `n × base_delay`
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Three attempts with linear backoff.
    pub fn linear(base_delay: Duration) -> Self {
        Self {
            max_attempts: 3,
            base_delay,
        }
    }

    /// Wait after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(Duration::from_millis(500))
    }
}

/// Result of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// The operation succeeded on attempt `attempt`
    Ready { value: T, attempt: u32 },
    /// Every attempt failed; `last_error` describes the final failure
    Unavailable { attempts: u32, last_error: String },
}

impl<T> RetryOutcome<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            RetryOutcome::Ready { value, .. } => Some(value),
            RetryOutcome::Unavailable { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, RetryOutcome::Ready { .. })
    }
}

/// Run `op` under `policy`. `op` receives the 1-based attempt number.
pub async fn retry_linear<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(value) => return RetryOutcome::Ready { value, attempt },
            Err(e) => {
                debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
        }
    }

    RetryOutcome::Unavailable {
        attempts,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use tokio::time::Instant;

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::linear(Duration::from_millis(300));

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_after(1), Duration::from_millis(300));
        assert_eq!(policy.delay_after(2), Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let policy = RetryPolicy::linear(Duration::from_millis(400));
        let start = Instant::now();

        let outcome = retry_linear(&policy, |attempt| async move {
            if attempt < 3 {
                Err(Error::ContextUnavailable("observer".into()))
            } else {
                Ok("metrics")
            }
        })
        .await;

        assert_eq!(
            outcome,
            RetryOutcome::Ready {
                value: "metrics",
                attempt: 3
            }
        );
        // 400ms after the first failure, 800ms after the second
        assert_eq!(start.elapsed(), Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_without_trailing_delay() {
        let policy = RetryPolicy::linear(Duration::from_millis(300));
        let start = Instant::now();

        let outcome: RetryOutcome<()> = retry_linear(&policy, |_| async {
            Err(Error::ContextUnavailable("observer".into()))
        })
        .await;

        assert_matches!(outcome, RetryOutcome::Unavailable { attempts: 3, .. });
        assert_eq!(start.elapsed(), Duration::from_millis(900));
        assert!(outcome.into_option().is_none());
    }

    #[tokio::test]
    async fn test_first_attempt_success_has_no_delay() {
        let outcome = retry_linear(&RetryPolicy::default(), |_| async { Ok(1) }).await;
        assert!(outcome.is_ready());
        assert_eq!(outcome.into_option(), Some(1));
    }
}
