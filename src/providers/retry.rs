//! Retry configuration, delay calculation, and the shared retry loop.
//!
//! Provides [`RetryConfig`] for controlling retry behaviour and
//! `with_retry()`, which the dispatcher wraps around every provider call.
//! Each attempt runs under a hard deadline; exceeding it counts as a
//! transient failure.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{PromptgateError, Retryability};
use crate::telemetry;
use crate::Result;

/// Configuration for retry behaviour on transient errors.
///
/// Uses exponential backoff with optional jitter:
///
/// ```rust
/// # use promptgate::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200))
///     .jitter(true);
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 500ms.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    pub max_delay: Duration,
    /// Whether to add random jitter to delays. Default: true.
    pub jitter: bool,
    /// Hard deadline for a single provider attempt. Default: 60s.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the initial request).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Set the base delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Set the per-attempt deadline.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// Uses exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`.
    /// Does NOT include jitter; see [`effective_delay()`](Self::effective_delay)
    /// for the full calculation.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// Calculate the effective delay, respecting provider `retry_after` hints.
    ///
    /// A `retry_after` hint takes precedence over the calculated backoff and
    /// is never jittered, but is still capped at `max_delay`. Computed
    /// backoff is scaled into `[delay/2, delay]` when jitter is on.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let delay = self.delay_for_attempt(attempt);
        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// Outcome of a retried operation: the final result and how many attempts
/// were made to get it.
#[derive(Debug)]
pub(crate) struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Execute an async operation with retry logic.
///
/// Retries while `classify` says the error is retryable, up to
/// `config.max_attempts`, using exponential backoff and respecting
/// `retry_after` hints. Each attempt is bounded by `config.attempt_timeout`.
/// Cancellation is checked before each attempt and while sleeping.
///
/// Permanent errors are returned immediately without retry.
pub(crate) async fn with_retry<F, Fut, T, C>(
    config: &RetryConfig,
    provider_name: &str,
    cancel: &CancellationToken,
    classify: C,
    mut f: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&PromptgateError) -> Retryability,
{
    let mut attempts = 0;
    let mut last_err = None;
    while attempts < config.max_attempts {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(PromptgateError::Cancelled),
                attempts,
            };
        }

        let attempt = attempts;
        attempts += 1;
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PromptgateError::Cancelled),
            r = tokio::time::timeout(config.attempt_timeout, f(attempt)) => {
                r.unwrap_or(Err(PromptgateError::Timeout(config.attempt_timeout)))
            }
        };
        metrics::histogram!(telemetry::PROVIDER_CALL_DURATION_SECONDS,
            "provider" => provider_name.to_owned(),
        )
        .record(started.elapsed().as_secs_f64());

        let err = match result {
            Ok(value) => {
                metrics::counter!(telemetry::PROVIDER_CALLS_TOTAL,
                    "provider" => provider_name.to_owned(),
                    "status" => "ok",
                )
                .increment(1);
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(PromptgateError::Cancelled) => {
                return RetryOutcome {
                    result: Err(PromptgateError::Cancelled),
                    attempts,
                };
            }
            Err(e) => e,
        };

        metrics::counter!(telemetry::PROVIDER_CALLS_TOTAL,
            "provider" => provider_name.to_owned(),
            "status" => err.kind().code(),
        )
        .increment(1);

        if classify(&err) == Retryability::Permanent {
            return RetryOutcome {
                result: Err(err),
                attempts,
            };
        }

        if attempts < config.max_attempts {
            metrics::counter!(telemetry::RETRIES_TOTAL,
                "provider" => provider_name.to_owned(),
            )
            .increment(1);
            let delay = config.effective_delay(attempt, err.retry_after());
            warn!(
                provider = provider_name,
                attempt = attempts,
                max_attempts = config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient error"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(PromptgateError::Cancelled),
                        attempts,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        last_err = Some(err);
    }
    RetryOutcome {
        result: Err(last_err.unwrap_or(PromptgateError::NoProvider)),
        attempts,
    }
}
