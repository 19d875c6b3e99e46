use std::{future::Future, time::Duration};

use tokio::time::{Instant, sleep};

use crate::error::BackendError;

/// An attempt that ran at least this long before failing resets the backoff.
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: Option<u32>,
    reset_after: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_retries: None,
            reset_after: DEFAULT_RESET_AFTER,
        }
    }

    /// Give up after this many consecutive failures; `None` retries forever.
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries.filter(|max| *max > 0);
        self
    }

    pub fn with_reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = reset_after;
        self
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn reset_after(&self) -> Duration {
        self.reset_after
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 300_000)
    }
}

/// Errors that may carry a server-provided retry hint.
pub trait RetryHint {
    fn retry_after_ms(&self) -> Option<u64> {
        None
    }
}

impl RetryHint for BackendError {
    fn retry_after_ms(&self) -> Option<u64> {
        self.retry_after_ms
    }
}

/// Failure report handed to the `on_failure` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based count of consecutive failures since the last backoff reset.
    pub attempt: u32,
    /// Sleep before the next attempt.
    pub delay: Duration,
}

/// Run `action` until it succeeds, sleeping `min(base * 2^n, max)` between
/// failures.
///
/// `on_failure` sees every error before the sleep. An attempt that ran for
/// longer than [`RetryPolicy::reset_after`] before failing resets `n` to zero,
/// so a mostly-healthy connection reconnects fast while a broken one climbs to
/// the cap. With `max_retries` set, the last error is returned once exhausted.
pub async fn run_with_retry<T, E, F, Fut, N>(
    policy: &RetryPolicy,
    mut action: F,
    mut on_failure: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryHint,
    N: FnMut(&E, RetryAttempt),
{
    let mut attempt: u32 = 0;
    loop {
        let started = Instant::now();
        let err = match action().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if started.elapsed() > policy.reset_after {
            attempt = 0;
        }
        if let Some(max) = policy.max_retries
            && attempt >= max
        {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt, err.retry_after_ms());
        attempt = attempt.saturating_add(1);
        on_failure(&err, RetryAttempt { attempt, delay });
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::error::BackendErrorCategory;

    #[test]
    fn starts_with_base_delay() {
        let policy = RetryPolicy::new(250, 8_000);
        assert_eq!(
            policy.delay_for_attempt(0, None),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn scales_exponentially_for_attempts() {
        let policy = RetryPolicy::new(100, 10_000);
        assert_eq!(
            policy.delay_for_attempt(3, None),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn caps_delay_at_max() {
        let policy = RetryPolicy::new(1_000, 4_000);
        assert_eq!(
            policy.delay_for_attempt(5, None),
            Duration::from_millis(4_000)
        );
    }

    #[test]
    fn honors_retry_after_hint_when_larger() {
        let policy = RetryPolicy::new(500, 20_000);
        assert_eq!(
            policy.delay_for_attempt(1, Some(10_000)),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn zero_max_retries_means_unbounded() {
        let policy = RetryPolicy::default().with_max_retries(Some(0));
        assert_eq!(policy.max_retries(), None);
    }

    fn transport_error() -> BackendError {
        BackendError::new(BackendErrorCategory::Network, "io_error", "reset by peer")
    }

    /// Scripted attempts: how long each runs before returning its result.
    fn scripted(
        steps: Vec<(Duration, Result<&'static str, BackendError>)>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<&'static str, BackendError>>>>
    {
        let mut steps = VecDeque::from(steps);
        move || {
            let (runtime, result) = steps
                .pop_front()
                .unwrap_or((Duration::ZERO, Ok("exhausted")));
            Box::pin(async move {
                sleep(runtime).await;
                result
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_failures_double_the_delay() {
        let policy = RetryPolicy::new(1_000, 300_000);
        let mut steps: Vec<_> = (0..5)
            .map(|_| (Duration::ZERO, Err(transport_error())))
            .collect();
        steps.push((Duration::ZERO, Ok("up")));

        let mut reports = Vec::new();
        let result = run_with_retry(&policy, scripted(steps), |_, attempt| {
            reports.push(attempt)
        })
        .await;

        assert_eq!(result, Ok("up"));
        let delays: Vec<u64> = reports.iter().map(|r| r.delay.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        let attempts: Vec<u32> = reports.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_attempt_resets_backoff() {
        let policy = RetryPolicy::new(1_000, 300_000);
        let steps = vec![
            (Duration::ZERO, Err(transport_error())),
            (Duration::ZERO, Err(transport_error())),
            (Duration::ZERO, Err(transport_error())),
            (Duration::from_secs(11), Err(transport_error())),
            (Duration::ZERO, Err(transport_error())),
            (Duration::ZERO, Ok("up")),
        ];

        let mut delays = Vec::new();
        run_with_retry(&policy, scripted(steps), |_, attempt| {
            delays.push(attempt.delay.as_secs())
        })
        .await
        .expect("final attempt succeeds");

        assert_eq!(delays, vec![1, 2, 4, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_capped_at_max() {
        let policy = RetryPolicy::new(1_000, 5_000);
        let mut steps: Vec<_> = (0..4)
            .map(|_| (Duration::ZERO, Err(transport_error())))
            .collect();
        steps.push((Duration::ZERO, Ok("up")));

        let mut delays = Vec::new();
        run_with_retry(&policy, scripted(steps), |_, attempt| {
            delays.push(attempt.delay.as_secs())
        })
        .await
        .expect("final attempt succeeds");

        assert_eq!(delays, vec![1, 2, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let policy = RetryPolicy::new(1_000, 60_000).with_max_retries(Some(2));
        let steps = (0..5)
            .map(|_| (Duration::ZERO, Err(transport_error())))
            .collect();

        let mut failures = 0;
        let result = run_with_retry(&policy, scripted(steps), |_, _| failures += 1).await;

        let err = result.expect_err("retries must be exhausted");
        assert_eq!(err.code, "io_error");
        assert_eq!(failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_hint_overrides_short_backoff() {
        let policy = RetryPolicy::new(1_000, 60_000);
        let limited = BackendError::new(BackendErrorCategory::RateLimited, "M_LIMIT_EXCEEDED", "slow")
            .with_retry_after(Duration::from_secs(9));
        let steps = vec![(Duration::ZERO, Err(limited)), (Duration::ZERO, Ok("up"))];

        let mut delays = Vec::new();
        run_with_retry(&policy, scripted(steps), |_, attempt| {
            delays.push(attempt.delay)
        })
        .await
        .expect("second attempt succeeds");

        assert_eq!(delays, vec![Duration::from_secs(9)]);
    }
}
