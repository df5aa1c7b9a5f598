//! Retry with backoff, and fallback on exhaustion.
//!
//! [`ResilientCall`] wraps one dependency operation (AI inference request,
//! database query) and returns an [`Outcome`] instead of raising: the caller
//! sees whether it got a fresh value, a degraded fallback, or an error.
//!
//! Delays follow `base_delay * backoff_multiplier^(n - 1)` before the n-th
//! retry, capped at `max_delay`. Upstream `retry_after` hints replace the
//! computed delay (still capped). No lock from any other component is held
//! while sleeping.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stats::{StatsEvent, StatsRegistry};
use crate::{ResilioError, Result};

/// Which preset a call uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// Requests to the external AI service.
    Ai,
    Database,
    Default,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Ai => "ai",
            CallKind::Database => "database",
            CallKind::Default => "default",
        }
    }
}

/// Backoff configuration for transient failures.
///
/// ```rust
/// # use resilio::RetryPolicy;
/// # use std::time::Duration;
/// let policy = RetryPolicy::new()
///     .max_attempts(3)
///     .base_delay(Duration::from_millis(100))
///     .backoff_multiplier(2.0)
///     .jitter(false);
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first one. 1 disables retries. Default: 2.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds. Default: 1000.
    pub base_delay_ms: u64,
    /// Growth factor between consecutive retries. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Ceiling for any single delay, in milliseconds. Default: 5000.
    pub max_delay_ms: u64,
    /// Scale computed delays by a random factor in `[0.5, 1.0]`. Default: true.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the general-purpose defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for AI service calls: fail fast, the user is waiting.
    pub fn ai() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 500,
            max_delay_ms: 3_000,
            ..Self::default()
        }
    }

    /// Preset for database reads and writes.
    pub fn database() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            ..Self::default()
        }
    }

    /// Single attempt, no retry.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the first call).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = duration_ms(delay);
        self
    }

    /// Set the growth factor between consecutive retries.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the ceiling for any single delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    pub fn max_delay_duration(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before retry number `retry + 1` (0-indexed), without jitter.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }

    /// Delay actually slept: the upstream hint if one was given, otherwise
    /// the (possibly jittered) backoff, always capped at `max_delay`.
    pub fn effective_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_delay_duration()),
            None if self.jitter => {
                let factor = rand::rng().random_range(0.5..=1.0);
                self.delay_for_attempt(retry).mul_f64(factor)
            }
            None => self.delay_for_attempt(retry),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Result of a [`ResilientCall`].
#[derive(Debug)]
pub enum Outcome<T> {
    /// The operation succeeded, possibly after retries.
    Success(T),
    /// Retries were exhausted and the configured fallback was served.
    Fallback { value: T, cause: ResilioError },
    Failure(ResilioError),
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// True when the value is a fallback rather than a fresh result.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Fallback { .. })
    }

    /// The value, fresh or fallback.
    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Success(value) | Outcome::Fallback { value, .. } => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ResilioError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Fallback { cause, .. } => Some(cause),
            Outcome::Failure(e) => Some(e),
        }
    }

    /// Collapse into a `Result`; a fallback counts as success.
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Success(value) | Outcome::Fallback { value, .. } => Ok(value),
            Outcome::Failure(e) => Err(e),
        }
    }
}

/// Retry/fallback wrapper around a single dependency operation.
///
/// ```rust,ignore
/// let outcome = ResilientCall::new("classify", RetryPolicy::ai())
///     .fallback(Diagnosis::unavailable())
///     .cancel_on(request_token)
///     .execute(|| client.post_json("/v1/classify", &body))
///     .await;
/// ```
pub struct ResilientCall<T> {
    operation: String,
    policy: RetryPolicy,
    fallback: Option<T>,
    cancel: Option<CancellationToken>,
    stats: Option<Arc<StatsRegistry>>,
}

impl<T> ResilientCall<T> {
    /// `operation` names the call in logs and per-operation counters.
    pub fn new(operation: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            operation: operation.into(),
            policy,
            fallback: None,
            cancel: None,
            stats: None,
        }
    }

    /// Value served when a transient failure outlasts every attempt.
    pub fn fallback(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }

    /// Like [`fallback`](Self::fallback), clearing it on `None`.
    pub fn fallback_opt(mut self, value: Option<T>) -> Self {
        self.fallback = value;
        self
    }

    /// Stop retrying once `token` is cancelled. Checked before each attempt
    /// and raced against each backoff sleep.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Report attempts, retries and fallbacks to a shared registry.
    pub fn stats(mut self, stats: Arc<StatsRegistry>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` until it succeeds, fails permanently, runs out of attempts,
    /// or the call is cancelled.
    ///
    /// Permanent errors (see [`ResilioError::is_transient`]) are returned at
    /// once and never replaced by the fallback.
    pub async fn execute<F, Fut>(mut self, mut f: F) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if self.is_cancelled() {
                return self.cancelled(attempt);
            }
            attempt += 1;
            self.emit(StatsEvent::Attempt {
                operation: &self.operation,
            });

            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = %self.operation, attempt, "succeeded after retry");
                    }
                    self.emit(StatsEvent::Success {
                        operation: &self.operation,
                    });
                    return Outcome::Success(value);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.policy.effective_delay(attempt - 1, e.retry_after());
                    warn!(
                        operation = %self.operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    self.emit(StatsEvent::Retry {
                        operation: &self.operation,
                    });
                    if !self.backoff(delay).await {
                        return self.cancelled(attempt);
                    }
                }
                Err(e) if e.is_transient() => return self.exhausted(e),
                Err(e) => {
                    debug!(operation = %self.operation, error = %e, "permanent error, not retrying");
                    self.emit(StatsEvent::Failure {
                        operation: &self.operation,
                    });
                    return Outcome::Failure(e);
                }
            }
        }
    }

    fn exhausted(&mut self, cause: ResilioError) -> Outcome<T> {
        match self.fallback.take() {
            Some(value) => {
                warn!(
                    operation = %self.operation,
                    attempts = self.policy.max_attempts.max(1),
                    error = %cause,
                    "attempts exhausted, serving fallback"
                );
                self.emit(StatsEvent::FallbackServed {
                    operation: &self.operation,
                });
                Outcome::Fallback { value, cause }
            }
            None => {
                warn!(
                    operation = %self.operation,
                    attempts = self.policy.max_attempts.max(1),
                    error = %cause,
                    "attempts exhausted"
                );
                self.emit(StatsEvent::Failure {
                    operation: &self.operation,
                });
                Outcome::Failure(cause)
            }
        }
    }

    fn cancelled(&self, attempts: u32) -> Outcome<T> {
        debug!(operation = %self.operation, attempts, "call cancelled");
        self.emit(StatsEvent::Cancelled {
            operation: &self.operation,
        });
        Outcome::Failure(ResilioError::Cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Sleep for `delay`; false if cancelled first.
    async fn backoff(&self, delay: Duration) -> bool {
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            },
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }

    fn emit(&self, event: StatsEvent<'_>) {
        if let Some(stats) = &self.stats {
            stats.record(event);
        }
    }
}
