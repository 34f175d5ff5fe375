//! Stops one handler's failure from aborting its siblings.

use async_trait::async_trait;
use tracing::error;

use super::{Middleware, MiddlewareContext, Next};
use crate::error::EventResult;

/// Converts any error from the inner chain into `Ok(false)`.
///
/// The error text is recorded on the event so the failure stays visible in
/// history. Without this middleware in the chain, handler errors propagate
/// out of `publish()`.
#[derive(Debug, Default)]
pub struct ErrorIsolationMiddleware;

impl ErrorIsolationMiddleware {
    /// Create the error isolation middleware.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for ErrorIsolationMiddleware {
    fn name(&self) -> &str {
        "error_isolation"
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> EventResult<bool> {
        match next.run(ctx).await {
            Ok(processed) => Ok(processed),
            Err(e) => {
                error!(
                    event_id = %ctx.event.id(),
                    event_type = %ctx.event.event_type(),
                    handler = %ctx.handler_name,
                    attempt = ctx.attempt,
                    error = %e,
                    "Handler error isolated"
                );
                ctx.event
                    .record_handler_error(&ctx.handler_name, e.to_string());
                Ok(false)
            },
        }
    }
}
