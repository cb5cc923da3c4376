//! Bounded retry for optimistic-concurrency writes.

use std::future::Future;

use thiserror::Error;
use tracing::debug;

/// Classifies an error as a lost conditional write worth retrying.
pub trait Retryable {
    fn is_conflict(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("still conflicting after {attempts} attempts")]
    Exhausted { attempts: u32, last: E },

    #[error(transparent)]
    Fatal(E),
}

/// Run `op(attempt)` until it succeeds, fails with a non-conflict error, or
/// has conflicted `max_attempts` times. Each attempt is expected to reload
/// whatever it conditions its write on.
pub async fn retry_on_conflict<T, E, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() => {
                debug!(attempt, error = %e, "conditional write conflicted");
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
            }
            Err(e) => return Err(RetryError::Fatal(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Conflict,
        Broken,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_conflict(&self) -> bool {
            *self == TestError::Conflict
        }
    }

    #[tokio::test]
    async fn succeeds_after_conflicts() {
        let result = retry_on_conflict(3, |attempt| async move {
            if attempt < 3 {
                Err(TestError::Conflict)
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = retry_on_conflict(3, |_| {
            calls += 1;
            async { Err(TestError::Conflict) }
        })
        .await;
        assert!(matches!(
            result,
            Err(RetryError::Exhausted { attempts: 3, last: TestError::Conflict })
        ));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = retry_on_conflict(5, |_| {
            calls += 1;
            async { Err(TestError::Broken) }
        })
        .await;
        assert!(matches!(result, Err(RetryError::Fatal(TestError::Broken))));
        assert_eq!(calls, 1);
    }
}
