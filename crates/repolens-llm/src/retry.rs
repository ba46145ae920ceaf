use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Exponential backoff policy wrapped around a fallible external call.
///
/// Attempt `n` (0-based) waits `base_delay * 2^n` before the next try, capped at
/// `max_delay`. With `jitter` enabled up to a quarter of the delay is added on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps; used by tests and local backends.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    /// Deterministic part of the delay after the given failed attempt.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Delay after the given failed attempt, including jitter when enabled.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let quarter = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
        let extra = rand::rng().random_range(0..=quarter);
        base + Duration::from_millis(extra)
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or the
    /// attempt budget runs out.
    ///
    /// A rate-limit error carrying `Retry-After` overrides the computed delay
    /// (still capped by `max_delay_ms`).
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error unchanged, or
    /// [`LlmError::RetriesExhausted`] wrapping the last transient error.
    pub async fn retry<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= attempts {
                return Err(LlmError::RetriesExhausted {
                    op: op.to_owned(),
                    attempts,
                    last: Box::new(err),
                });
            }

            let delay = match &err {
                LlmError::RateLimited {
                    retry_after: Some(after),
                } => (*after).min(Duration::from_millis(self.max_delay_ms)),
                _ => self.delay_for(attempt - 1),
            };
            tracing::warn!(
                op,
                attempt,
                max_attempts = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "transient failure, retrying: {err}"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Parse the `Retry-After` header value as seconds.
pub(crate) fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let val = response.headers().get(reqwest::header::RETRY_AFTER)?;
    let secs = val.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}
