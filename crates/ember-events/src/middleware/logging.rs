//! Logs handler start, outcome and duration without touching the result.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Middleware, MiddlewareContext, Next};
use crate::error::EventResult;

/// Structured logging around each handler invocation.
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    /// Create the logging middleware.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> EventResult<bool> {
        debug!(
            event_id = %ctx.event.id(),
            event_type = %ctx.event.event_type(),
            handler = %ctx.handler_name,
            "Handler started"
        );

        let result = next.run(ctx).await;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = ctx.elapsed().as_millis() as u64;
        match &result {
            Ok(true) => debug!(
                event_id = %ctx.event.id(),
                handler = %ctx.handler_name,
                duration_ms,
                "Handler succeeded"
            ),
            Ok(false) => info!(
                event_id = %ctx.event.id(),
                handler = %ctx.handler_name,
                duration_ms,
                "Handler did not process event"
            ),
            Err(e) => warn!(
                event_id = %ctx.event.id(),
                handler = %ctx.handler_name,
                duration_ms,
                error = %e,
                "Handler failed"
            ),
        }

        result
    }
}
