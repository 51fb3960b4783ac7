//! Bounded retry with fixed or exponential backoff.
//!
//! [`retry`] invokes an operation until it succeeds, fails with a permanent
//! error, or the attempt budget runs out. Cancellation is observed between
//! attempts and interrupts the wait.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Interval between two attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles after every attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    pub max_attempts: u32,
}

/// Interval used by the standard policies.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

impl RetryPolicy {
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Fixed(interval),
            max_attempts,
        }
    }

    pub fn exponential(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            backoff: Backoff::Exponential { initial, max },
            max_attempts,
        }
    }

    /// A single attempt, no retries.
    pub fn once() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    /// Long convergence waits, e.g. the control plane coming up.
    pub fn standard() -> Self {
        Self::fixed(RETRY_INTERVAL, 100)
    }

    /// Short checks and object updates.
    pub fn less() -> Self {
        Self::fixed(RETRY_INTERVAL, 20)
    }

    /// Waiting for a Kubernetes node to register.
    pub fn node_registration() -> Self {
        Self::fixed(RETRY_INTERVAL, 250)
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Run `op` under `policy`.
///
/// Only transient errors are retried. Once the budget is exhausted the last
/// transient error is returned wrapped in [`OrchestratorError::RetryExhausted`]
/// naming `what`, even when the budget was a single attempt.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(what.to_string()));
        }
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(OrchestratorError::RetryExhausted {
                what: what.to_string(),
                attempts: attempt,
                source: Box::new(err),
            });
        }

        let delay = policy.delay_after(attempt);
        debug!(what, attempt, max_attempts, error = %err, ?delay, "Retrying");
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(OrchestratorError::Cancelled(what.to_string()));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Fails with a transient error `failures` times, then succeeds.
    fn flaky(failures: u32) -> (Arc<AtomicU32>, impl FnMut() -> futures::future::Ready<Result<u32>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let op = move || {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            futures::future::ready(if call <= failures {
                Err(OrchestratorError::NotReady(format!("attempt {call}")))
            } else {
                Ok(call)
            })
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_within_budget() {
        let (calls, op) = flaky(4);
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 5);

        let value = retry(&policy, &CancellationToken::new(), "planet", op)
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_returns_last_error() {
        let (calls, op) = flaky(4);
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 4);

        let err = retry(&policy, &CancellationToken::new(), "waiting for planet", op)
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            OrchestratorError::RetryExhausted {
                what,
                attempts,
                source,
            } => {
                assert_eq!(what, "waiting for planet");
                assert_eq!(attempts, 4);
                assert_eq!(source.to_string(), "attempt 4");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_permanent_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 10);

        let err = retry(&policy, &CancellationToken::new(), "update", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(OrchestratorError::BadParameter("no profile".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::BadParameter(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_attempt_names_what_was_awaited() {
        let (calls, op) = flaky(1);
        let err = retry(&RetryPolicy::once(), &CancellationToken::new(), "node-1 registration", op)
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            OrchestratorError::RetryExhausted { ref what, attempts: 1, ref source }
                if what == "node-1 registration" && matches!(**source, OrchestratorError::NotReady(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::fixed(Duration::from_secs(3600), 100);
        let (calls, op) = flaky(u32::MAX);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = retry(&policy, &cancel, "nodes", op).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_budget_of_n_absorbs_n_minus_one_failures(n in 2u32..10) {
            let policy = RetryPolicy::fixed(Duration::ZERO, n);
            let (_, op) = flaky(n - 1);
            let ok = tokio_test::block_on(retry(&policy, &CancellationToken::new(), "op", op));
            proptest::prop_assert_eq!(ok.unwrap(), n);

            let policy = RetryPolicy::fixed(Duration::ZERO, n - 1);
            let (calls, op) = flaky(n - 1);
            let err = tokio_test::block_on(retry(&policy, &CancellationToken::new(), "op", op))
                .unwrap_err();
            proptest::prop_assert_eq!(calls.load(Ordering::SeqCst), n - 1);
            let last = format!("attempt {}", n - 1);
            let matches_last = match &err {
                OrchestratorError::RetryExhausted { source, .. } => source.to_string() == last,
                other => other.to_string() == last,
            };
            proptest::prop_assert!(matches_last, "unexpected error {}", err);
        }
    }

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy =
            RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10), 10);
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(4), Duration::from_secs(8));
        assert_eq!(policy.delay_after(5), Duration::from_secs(10));
    }
}
