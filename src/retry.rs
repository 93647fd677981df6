//! Bounded retry with exponential backoff for vendor API calls.
//!
//! Only statuses flagged by [`PipelineError::retryable`] (429, 503, 504) are
//! retried. Anything else that is not ok fails on the spot, and credential
//! errors raised by the call itself pass straight through.
//!
//! Backoff sleeps go through a [`Sleeper`] so tests can record them instead
//! of waiting.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{PipelineError, PipelineResult};
use crate::normalize::ApiResult;

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// List endpoints (orders, order items): 6 attempts from 800ms.
    pub const fn list() -> Self {
        Self::new(6, Duration::from_millis(800))
    }

    /// Summary endpoints (inventory): 4 attempts from 1s.
    pub const fn summary() -> Self {
        Self::new(4, Duration::from_millis(1000))
    }

    /// Delay after failed attempt `attempt` (0-based): `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Run `call` until it returns an ok result, a non-retryable failure, or
/// the policy's attempts are used up.
pub async fn with_retry<F, Fut>(
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
    stage: &str,
    run_id: &str,
    mut call: F,
) -> PipelineResult<ApiResult>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<ApiResult>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = call().await?;
        if result.ok {
            return Ok(result);
        }

        let err = PipelineError::ApiRequest {
            message: result
                .error
                .clone()
                .unwrap_or_else(|| format!("HTTP {}: request failed", result.status)),
            status: result.status,
            stage: stage.to_string(),
            run_id: run_id.to_string(),
            debug: result.debug,
        };

        if !err.retryable() || attempt + 1 >= attempts {
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        warn!(
            run_id,
            stage,
            status = result.status,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "retrying vendor api call"
        );
        sleeper.sleep(delay).await;
        attempt += 1;
    }
}
