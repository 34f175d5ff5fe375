//! Retry with exponential backoff.
//!
//! Only errors are retried. A handler that returns `Ok(false)` has made a
//! decision, and that decision is returned as-is after a single attempt.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Middleware, MiddlewareContext, Next};
use crate::error::EventResult;

/// Retry behaviour for handler errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Multiplier applied per further attempt.
    pub backoff_factor: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Retries without sleeping in between, for tests and local work.
    #[must_use]
    pub fn no_delay(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, 1.0)
    }

    /// Caps the delay between attempts.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed):
    /// `base * factor^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_after(&self, base_delay: Duration, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // Precision loss is acceptable for delay calculations.
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = base_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms.max(0.0) as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), 2.0)
    }
}

/// Re-runs the inner chain when it returns an error.
#[derive(Debug, Default)]
pub struct RetryMiddleware {
    config: RetryConfig,
}

impl RetryMiddleware {
    /// Create the retry middleware.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// The configured defaults.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> EventResult<bool> {
        let (max_attempts, base_delay) = ctx
            .retry_policy
            .unwrap_or((self.config.max_retries, self.config.base_delay));
        let max_attempts = max_attempts.max(1);

        let mut attempt: u32 = 1;
        loop {
            ctx.attempt = attempt;
            match next.run(ctx).await {
                Ok(processed) => {
                    if attempt > 1 {
                        debug!(
                            handler = %ctx.handler_name,
                            attempt,
                            "Handler succeeded after retry"
                        );
                    }
                    return Ok(processed);
                },
                Err(e) if attempt < max_attempts => {
                    let delay = self.config.delay_after(base_delay, attempt);
                    warn!(
                        event_id = %ctx.event.id(),
                        handler = %ctx.handler_name,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Handler failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt = attempt.saturating_add(1);
                },
                Err(e) => {
                    warn!(
                        event_id = %ctx.event.id(),
                        handler = %ctx.handler_name,
                        attempts = attempt,
                        error = %e,
                        "Handler retries exhausted"
                    );
                    return Err(e);
                },
            }
        }
    }
}
