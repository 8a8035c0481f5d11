//! Reconnect and retry policies.
//!
//! One [`RetryPolicy`] type drives both the stream transport's reconnect
//! loop (unbounded, fixed interval by default) and bounded retries of
//! request/response calls through [`retry_async`].

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Delay between stream reconnect attempts unless configured otherwise.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(2000);

/// Policy controlling how many attempts are made and how long to wait
/// between them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first one. `None` retries
    /// forever.
    pub max_attempts: Option<usize>,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for backoff growth. Equal to `initial_backoff` for a
    /// fixed interval.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Retries forever, waiting exactly `interval` between attempts.
    pub fn fixed_interval(interval: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_backoff: interval,
            max_backoff: interval,
            jitter: Duration::ZERO,
        }
    }

    /// Retries forever, doubling the delay from `initial` up to `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_backoff: initial,
            max_backoff: max.max(initial),
            jitter: Duration::ZERO,
        }
    }

    /// Short bounded policy for request/response API calls.
    pub fn low_latency() -> Self {
        Self {
            max_attempts: Some(2),
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(100),
            jitter: Duration::from_millis(25),
        }
    }

    /// Caps the number of attempts. Zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns whether another attempt may follow `failed_attempts` failures.
    pub fn allows_retry(&self, failed_attempts: usize) -> bool {
        match self.max_attempts {
            Some(max) => failed_attempts < max.max(1),
            None => true,
        }
    }

    /// Computes the delay to apply before retrying after the given failure.
    ///
    /// `attempt` is 1-based and corresponds to the attempt that just failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            if delay >= self.max_backoff {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed_interval(DEFAULT_RECONNECT_INTERVAL)
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number. `should_retry` decides whether
/// an error is worth another attempt. An unbounded policy keeps retrying
/// for as long as `should_retry` accepts the error.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !policy.allows_retry(attempt) || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_attempts = ?policy.max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
