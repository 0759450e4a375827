//! Automatic retry with exponential backoff and jitter.
//!
//! Only failures that classify themselves as transient (upstream rate
//! limiting) are retried. Every other failure propagates on first occurrence.

use crate::error::ModelError;
use rand::RngExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Upper bound of the jitter widening, as a fraction of the computed delay.
const JITTER_SPREAD: f64 = 0.25;

/// Backoff parameters. A pure value with no shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = no retries, fail immediately).
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "crate::agent::config::duration_ms")]
    #[schemars(with = "u64")]
    pub base_delay: Duration,
    /// Upper bound for the exponential part of the delay.
    #[serde(rename = "max_delay_ms", with = "crate::agent::config::duration_ms")]
    #[schemars(with = "u64")]
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0).
    pub multiplier: f64,
    /// Widen each delay by a random amount up to 25%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy with the given number of retries and default timings.
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::with_retries(0)
    }

    /// Deterministic backoff for a 0-indexed attempt:
    /// `base_delay * multiplier^attempt`, clamped to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retry `attempt`. A server-specified retry-after wins over
    /// the computed backoff; jitter applies to either.
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after.unwrap_or_else(|| self.delay_for_attempt(attempt));
        if self.jitter {
            let spread = rand::rng().random_range(0.0..=JITTER_SPREAD);
            delay.mul_f64(1.0 + spread)
        } else {
            delay
        }
    }
}

/// Classifies a failure as retry-eligible.
pub trait Transient {
    fn is_transient(&self) -> bool;

    /// Server-specified wait before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Transient for ModelError {
    fn is_transient(&self) -> bool {
        matches!(self, ModelError::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Details handed to the retry callback before each backoff sleep.
#[derive(Debug)]
pub struct RetryNotice<'a, E> {
    /// 1-based retry number.
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub error: &'a E,
}

/// Run `operation`, retrying transient failures per `policy`.
///
/// `on_retry` fires once per scheduled retry, before the sleep. After the
/// retries are exhausted the last failure is returned unchanged.
pub async fn with_retry<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: R,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(RetryNotice<'_, E>),
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.next_delay(attempt, e.retry_after());
                attempt += 1;
                warn!(
                    "Transient failure (attempt {}/{}): {e}. Retrying in {delay:?}...",
                    attempt, policy.max_retries,
                );
                on_retry(RetryNotice {
                    attempt,
                    max_retries: policy.max_retries,
                    delay,
                    error: &e,
                });
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
