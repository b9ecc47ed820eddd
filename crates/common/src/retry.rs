//! Centralized retry policy.
//!
//! Each external dependency type (language model, knowledge store, persistence)
//! gets one [`RetryPolicy`] value. Components run their remote calls through
//! [`with_retry`] so transient failures are absorbed locally and only terminal
//! outcomes reach the orchestrator.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HealmateError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts after an `UpstreamUnavailable` failure.
    #[serde(default = "default_upstream_retries")]
    pub upstream_retries: u32,
    /// Extra attempts after a `RateLimited` failure.
    #[serde(default = "default_rate_limit_retries")]
    pub rate_limit_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_upstream_retries() -> u32 {
    1
}

fn default_rate_limit_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::llm()
    }
}

impl RetryPolicy {
    pub fn llm() -> Self {
        Self {
            upstream_retries: default_upstream_retries(),
            rate_limit_retries: default_rate_limit_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }

    /// Embedding and vector search calls sit on the turn's critical path.
    pub fn knowledge_store() -> Self {
        Self {
            upstream_retries: 1,
            rate_limit_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }

    pub fn persistence() -> Self {
        Self {
            upstream_retries: 1,
            rate_limit_retries: 0,
            initial_delay_ms: 100,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }

    pub fn none() -> Self {
        Self {
            upstream_retries: 0,
            rate_limit_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    pub fn compute_delay(&self, attempt: u32) -> u64 {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let jitter = (base * 0.1 * jitter_fraction(attempt)) as u64;
        let delay = (base as u64).saturating_add(jitter);
        delay.min(self.max_delay_ms)
    }
}

/// Deterministic jitter in [0, 1) derived from the attempt number.
fn jitter_fraction(attempt: u32) -> f64 {
    let x = attempt.wrapping_add(1).wrapping_mul(2_654_435_761);
    (x % 100) as f64 / 100.0
}

/// Run `op` until it succeeds, fails terminally, or exhausts the budget the
/// policy grants for its error kind.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut upstream_used = 0u32;
    let mut rate_limit_used = 0u32;
    let mut attempt = 0u32;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let allowed = match &err {
            HealmateError::UpstreamUnavailable { .. } if upstream_used < policy.upstream_retries => {
                upstream_used += 1;
                true
            }
            HealmateError::RateLimited { .. } if rate_limit_used < policy.rate_limit_retries => {
                rate_limit_used += 1;
                true
            }
            _ => false,
        };
        if !allowed {
            return Err(err);
        }

        let delay = err
            .retry_after_ms()
            .map(|ms| ms.min(policy.max_delay_ms))
            .unwrap_or_else(|| policy.compute_delay(attempt));

        warn!(
            operation,
            attempt = attempt + 1,
            delay_ms = delay,
            error = %err,
            "Retrying after transient failure"
        );

        tokio::time::sleep(Duration::from_millis(delay)).await;
        attempt += 1;
    }
}
