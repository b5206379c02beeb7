//! Jittered exponential back-off for model calls.
//!
//! Only stream *creation* is retried: once a stream yields its first delta,
//! tokens may already have reached subscribers and the turn is committed.
//! Non-transient failures (auth, 4xx) surface immediately.

use std::time::Duration;

use hb_domain::config::RetryConfig;
use hb_domain::{CancelToken, Error, Result};

use crate::{DeltaStream, ModelClient, ModelRequest};

/// Back-off schedule derived from a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total wall-clock budget across attempts and waits.
    pub max_total: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_total: Duration::from_millis(cfg.max_total_ms),
        }
    }
}

impl RetryPolicy {
    /// Compute the delay for the given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let delay_ms = base_ms * 2f64.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // Add ~25% jitter to prevent thundering herd.
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
/// Not cryptographically secure — just enough to spread retry storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

/// Open a completion stream, retrying transient failures with back-off.
///
/// Waits observe the cancel token; the total elapsed time (attempts plus
/// waits) is bounded by `policy.max_total`, after which the last transient
/// error is wrapped in [`Error::Timeout`].
pub async fn stream_with_retry(
    client: &dyn ModelClient,
    req: &ModelRequest,
    policy: &RetryPolicy,
    cancel: &CancelToken,
) -> Result<DeltaStream> {
    let started = tokio::time::Instant::now();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match client.call(req.clone(), cancel.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if attempt >= policy.max_retries => {
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                if started.elapsed() + delay > policy.max_total {
                    return Err(Error::Timeout(format!(
                        "retry budget exhausted after {} attempts: {e}",
                        attempt + 1
                    )));
                }
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient model error, backing off"
                );
                if wait_with_cancellation(delay, cancel).await {
                    return Err(Error::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}

/// Sleep for `delay` unless the token fires first.
/// Returns `true` if cancelled, `false` if the wait completed normally.
async fn wait_with_cancellation(delay: Duration, cancel: &CancelToken) -> bool {
    let mut remaining = delay;
    let step = Duration::from_millis(25);
    while remaining > Duration::ZERO {
        if cancel.is_cancelled() {
            return true;
        }
        let chunk = remaining.min(step);
        tokio::time::sleep(chunk).await;
        remaining = remaining.saturating_sub(chunk);
    }
    cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use futures_util::stream;

    use hb_domain::{ModelDelta, StopReason};

    /// Like `Result::unwrap_err`, but without requiring `T: Debug`
    /// (`DeltaStream` is a boxed trait object and has no `Debug` impl).
    fn expect_err<T, E>(result: std::result::Result<T, E>) -> E {
        match result {
            Ok(_) => panic!("expected Err, got Ok"),
            Err(e) => e,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            max_total: Duration::from_secs(5),
        }
    }

    /// Fails with a transient error `failures` times, then succeeds.
    struct FlakyClient {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ModelClient for FlakyClient {
        async fn call(&self, _req: ModelRequest, _cancel: CancelToken) -> Result<DeltaStream> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(Error::TransientUpstream("503".into()));
            }
            Ok(Box::pin(stream::iter(vec![Ok(ModelDelta::Stop {
                reason: StopReason::EndTurn,
            })])))
        }
        fn provider_id(&self) -> &str {
            "flaky"
        }
    }

    struct AuthFailClient;

    #[async_trait]
    impl ModelClient for AuthFailClient {
        async fn call(&self, _req: ModelRequest, _cancel: CancelToken) -> Result<DeltaStream> {
            Err(Error::Unauthenticated("bad key".into()))
        }
        fn provider_id(&self) -> &str {
            "authfail"
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            model: hb_domain::config::ModelRef::new("mock", "m1"),
            messages: vec![],
            tools: vec![],
            options: Default::default(),
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let p = policy();
        let d0 = p.delay_for_attempt(0);
        let d2 = p.delay_for_attempt(2);
        assert!(d2 > d0);
        // Cap plus 25% jitter ceiling.
        assert!(p.delay_for_attempt(20) <= Duration::from_millis(125));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retried_until_success() {
        let client = FlakyClient {
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let cancel = CancelToken::new();
        let result = stream_with_retry(&client, &request(), &policy(), &cancel).await;
        assert!(result.is_ok());
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let client = FlakyClient {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let cancel = CancelToken::new();
        let err = expect_err(stream_with_retry(&client, &request(), &policy(), &cancel).await);
        assert!(err.is_transient());
        // Initial attempt + max_retries.
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_transient_surfaces_immediately() {
        let cancel = CancelToken::new();
        let err = expect_err(stream_with_retry(&AuthFailClient, &request(), &policy(), &cancel).await);
        assert_eq!(err.kind(), "unauthenticated");
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let client = FlakyClient {
            failures: 0,
            calls: AtomicU32::new(0),
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = expect_err(stream_with_retry(&client, &request(), &policy(), &cancel).await);
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn total_budget_bounds_waits() {
        let client = FlakyClient {
            failures: 10,
            calls: AtomicU32::new(0),
        };
        let tight = RetryPolicy {
            max_retries: 50,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(400),
            max_total: Duration::from_millis(300),
        };
        let cancel = CancelToken::new();
        let err = expect_err(stream_with_retry(&client, &request(), &tight, &cancel).await);
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn jitter_fraction_is_deterministic() {
        assert_eq!(pseudo_random_fraction(7), pseudo_random_fraction(7));
    }
}
