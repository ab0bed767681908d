//! Explicit retry policy with exponential backoff.
//!
//! Call sites that talk to flaky collaborators (the credential vault, the
//! broker API) hold a [`BackoffPolicy`] and drive it through [`retry`], so
//! the attempt ceiling and delay curve are plain data that can be configured
//! and tested on their own.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Exponential backoff policy.
///
/// `max_attempts` counts every attempt including the first one, so a policy
/// with `max_attempts = 1` never retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts allowed (at least 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per further attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter factor in `0.0..=1.0`; a delay `d` becomes a value in
    /// `[d * (1 - jitter), d * (1 + jitter)]`.
    #[serde(default)]
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Create a policy without jitter.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: duration_ms(base_delay),
            multiplier,
            max_delay_ms: duration_ms(max_delay),
            jitter: 0.0,
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub const fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    /// Set the jitter factor.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Attempt ceiling, never below one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.attempts()
    }

    /// Delay to wait after the `failed_attempt`-th attempt (1-indexed) failed.
    ///
    /// `base * multiplier^(failed_attempt - 1)`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        if failed_attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw_ms = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay_ms.max(self.base_delay_ms) as f64);
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    /// [`delay_after`](Self::delay_after) with jitter applied using
    /// `random` in `0.0..=1.0`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn jittered_delay_after(&self, failed_attempt: u32, random: f64) -> Duration {
        let delay = self.delay_after(failed_attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.min(1.0);
        let factor = 1.0 - jitter + 2.0 * jitter * random.clamp(0.0, 1.0);
        Duration::from_millis((delay.as_millis() as f64 * factor).max(0.0) as u64)
    }

    fn next_delay(&self, failed_attempt: u32) -> Duration {
        self.jittered_delay_after(failed_attempt, fastrand::f64())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: 0.0,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Result of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded on attempt `attempts`.
    Success {
        /// Value produced by the successful attempt.
        value: T,
        /// Attempts made, including the successful one.
        attempts: u32,
    },
    /// Every allowed attempt failed.
    Exhausted {
        /// Error from the final attempt.
        error: E,
        /// Attempts made.
        attempts: u32,
    },
    /// Cancelled while waiting between attempts.
    Aborted {
        /// Attempts made before cancellation.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Number of attempts made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Aborted { attempts } => *attempts,
        }
    }

    /// Returns true if the operation succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Run `operation` until it succeeds or `policy` runs out of attempts.
///
/// The closure receives the 1-indexed attempt number.
pub async fn retry<T, E, F, Fut>(policy: &BackoffPolicy, operation: F) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_cancel(policy, &CancellationToken::new(), operation).await
}

/// Like [`retry`], but gives up with [`RetryOutcome::Aborted`] if `cancel`
/// fires before or during a backoff sleep. An attempt already in flight is
/// never interrupted.
pub async fn retry_with_cancel<T, E, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome::Success {
                    value,
                    attempts: attempt,
                };
            },
            Err(error) => {
                if !policy.should_retry(attempt) {
                    return RetryOutcome::Exhausted {
                        error,
                        attempts: attempt,
                    };
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        return RetryOutcome::Aborted { attempts: attempt };
                    },
                    () = tokio::time::sleep(policy.next_delay(attempt)) => {},
                }
                attempt = attempt.saturating_add(1);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
    }

    #[test]
    fn delay_grows_exponentially() {
        let policy = BackoffPolicy::new(6, Duration::from_millis(100), Duration::from_secs(10), 2.0);
        assert_eq!(policy.delay_after(0), Duration::ZERO);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = BackoffPolicy::new(20, Duration::from_millis(100), Duration::from_millis(500), 2.0);
        assert_eq!(policy.delay_after(5), Duration::from_millis(500));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = BackoffPolicy::new(3, Duration::from_millis(1000), Duration::from_secs(10), 2.0)
            .with_jitter(0.2);
        assert_eq!(policy.jittered_delay_after(1, 0.0), Duration::from_millis(800));
        assert_eq!(policy.jittered_delay_after(1, 1.0), Duration::from_millis(1200));
        for _ in 0..50 {
            let d = policy.next_delay(1);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = BackoffPolicy::new(0, Duration::ZERO, Duration::ZERO, 2.0);
        assert_eq!(policy.attempts(), 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn policy_from_partial_toml() {
        let policy: BackoffPolicy = toml::from_str("max_attempts = 2").unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, 1_000);
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn succeeds_on_nth_attempt_without_extra_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome = retry(&fast(5), move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { if attempt < 3 { Err("refused") } else { Ok(attempt) } }
        })
        .await;

        assert_eq!(
            outcome,
            RetryOutcome::Success {
                value: 3,
                attempts: 3
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let outcome: RetryOutcome<(), &str> = retry(&fast(4), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err("down") }
        })
        .await;

        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                error: "down",
                attempts: 4
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn single_attempt_never_sleeps() {
        let outcome: RetryOutcome<(), &str> =
            retry(&BackoffPolicy::single_attempt(), |_| async { Err("nope") }).await;
        assert_eq!(outcome.attempts(), 1);
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn cancellation_aborts_between_attempts() {
        let policy = BackoffPolicy::new(10, Duration::from_secs(60), Duration::from_secs(60), 2.0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome: RetryOutcome<(), &str> =
            retry_with_cancel(&policy, &cancel, |_| async { Err("down") }).await;
        assert_eq!(outcome, RetryOutcome::Aborted { attempts: 1 });
    }
}
