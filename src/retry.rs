//! Bounded, fixed-interval retry shared by fetching and publishing.
//!
//! An operation reports each attempt as an [`Attempt`]. `Empty` ("ran fine but
//! produced nothing usable") and `Failed` are both retried; `Fatal` stops at
//! once. The delay between attempts is constant, there is no backoff. Both the
//! attempt and the delay race a [`CancellationToken`] so shutdown never waits
//! for a retry loop to run out.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Ready(T),
    Empty,
    Failed(E),
    Fatal(E),
}

impl<T, E> Attempt<T, E> {
    /// Maps a plain `Result`, letting `retryable` decide between `Failed` and `Fatal`.
    pub fn classify(result: Result<T, E>, retryable: impl FnOnce(&E) -> bool) -> Self {
        match result {
            Ok(value) => Attempt::Ready(value),
            Err(e) if retryable(&e) => Attempt::Failed(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed or came back empty. `last` is `None` when the final attempt was empty.
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: u32, last: Option<E> },

    #[error("stopped on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },

    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    pub fn error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last, .. } => last.as_ref(),
            RetryError::Aborted { error, .. } => Some(error),
            RetryError::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping `policy.delay` between attempts.
///
/// `op` receives the 1-based attempt number. `what` only labels log events.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: fmt::Display,
{
    let mut last = None;

    for attempt in 1..=policy.max_attempts {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = op(attempt) => outcome,
        };

        match outcome {
            Attempt::Ready(value) => {
                if attempt > 1 {
                    debug!(what, attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Attempt::Empty => {
                warn!(what, attempt, max_attempts = policy.max_attempts, "Attempt returned nothing");
                last = None;
            }
            Attempt::Failed(e) => {
                warn!(what, attempt, max_attempts = policy.max_attempts, error = %e, "Attempt failed");
                last = Some(e);
            }
            Attempt::Fatal(e) => {
                warn!(what, attempt, error = %e, "Attempt failed permanently, not retrying");
                return Err(RetryError::Aborted { attempt, error: e });
            }
        }

        if attempt < policy.max_attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(policy.delay) => {}
            }
        }
    }

    Err(RetryError::Exhausted {
        attempts: policy.max_attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    const DELAY: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_failures_with_k_delays() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, DELAY);
        let start = Instant::now();

        let result = retry(policy, &CancellationToken::new(), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 3 {
                    Attempt::Failed("boom")
                } else {
                    Attempt::Ready(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), DELAY * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_runs_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, DELAY);
        let start = Instant::now();

        let result: Result<(), _> = retry(policy, &CancellationToken::new(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Failed("nope") }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, Some("nope"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // No sleep after the final attempt.
        assert_eq!(start.elapsed(), DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_results_are_retried_like_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(RetryPolicy::new(3, DELAY), &CancellationToken::new(), "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Attempt::<_, &str>::Empty
                } else {
                    Attempt::Ready("bytes")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "bytes");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_on_empty_has_no_last_error() {
        let result: Result<(), RetryError<&str>> =
            retry(RetryPolicy::new(2, DELAY), &CancellationToken::new(), "test", |_| async {
                Attempt::Empty
            })
            .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 2, last: None })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_stops_immediately() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result: Result<(), _> = retry(RetryPolicy::new(5, DELAY), &CancellationToken::new(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Fatal("bad config") }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Aborted { attempt: 1, error: "bad config" })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_delay() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> = retry(
            RetryPolicy::new(5, Duration::from_secs(60)),
            &token,
            "test",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Failed("down") }
            },
        )
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn classify_uses_the_predicate() {
        let failed: Attempt<(), u8> = Attempt::classify(Err(1), |e| *e == 1);
        let fatal: Attempt<(), u8> = Attempt::classify(Err(2), |e| *e == 1);
        assert!(matches!(failed, Attempt::Failed(1)));
        assert!(matches!(fatal, Attempt::Fatal(2)));
    }

    #[test]
    fn policy_always_allows_one_attempt() {
        assert_eq!(RetryPolicy::new(0, DELAY).max_attempts, 1);
    }
}
