use rand::{Rng, thread_rng};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Exponential backoff with jitter: wait `base_delay * 2^attempt` plus up to
/// `max_jitter` between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Deterministic part of the wait after the failed attempt `attempt` (0-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(thread_rng().gen_range(0..jitter_ms))
        };
        self.backoff_for_attempt(attempt) + jitter
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The operation failed with an error the predicate did not consider retryable.
    #[error("{0}")]
    Fatal(E),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` attempts have been made. No sleep follows the last attempt.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Fatal(e)),
            Err(e) => {
                if attempt + 1 >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: e,
                    });
                }
                let wait = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    wait_secs = wait.as_secs_f64(),
                    "{e}; retrying after {:.2} seconds",
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum Fail {
        Busy,
        Broken,
    }

    impl std::fmt::Display for Fail {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    #[test]
    fn backoff_doubles_from_base() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(p.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(p.backoff_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_below_one_extra_second() {
        let p = RetryPolicy::default();
        for attempt in 0..3 {
            let d = p.delay_for_attempt(attempt);
            assert!(d >= p.backoff_for_attempt(attempt));
            assert!(d < p.backoff_for_attempt(attempt) + Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_non_retryable_without_sleeping() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let res: Result<(), _> = retry_with_backoff(
            &RetryPolicy::default(),
            |e| *e == Fail::Busy,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Fail::Broken) }
            },
        )
        .await;
        assert!(matches!(res, Err(RetryError::Fatal(Fail::Broken))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let res: Result<(), _> = retry_with_backoff(
            &RetryPolicy::default(),
            |e| *e == Fail::Busy,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Fail::Busy) }
            },
        )
        .await;
        match res {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, Fail::Busy);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // waits after attempts 0 and 1 only: 1s + 2s plus jitter
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_last_attempt() {
        let res = retry_with_backoff(
            &RetryPolicy::default(),
            |e: &Fail| *e == Fail::Busy,
            |attempt| async move {
                if attempt < 2 { Err(Fail::Busy) } else { Ok(attempt) }
            },
        )
        .await;
        assert_eq!(res.unwrap(), 2);
    }
}
