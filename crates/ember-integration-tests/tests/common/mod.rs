//! Shared bus builders for integration tests.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ember_events::{
    BusConfig, ChainableEventBus, EventBus, EventResult, Middleware, MiddlewareChain,
    MiddlewareContext, Next, RetryConfig,
};

/// Bus config with immediate retries and the given limits.
#[allow(dead_code)]
pub fn fast_config(max_concurrent_handlers: usize, max_history_size: usize) -> BusConfig {
    BusConfig {
        max_concurrent_handlers,
        max_history_size,
        retry: RetryConfig::no_delay(3),
        ..BusConfig::default()
    }
}

/// Standard chain, no retry delays.
#[allow(dead_code)]
pub fn fast_bus() -> EventBus {
    ember_test::init_test_logging();
    EventBus::with_config(fast_config(10, 100))
}

/// Chainable bus over [`fast_bus`].
#[allow(dead_code)]
pub fn fast_chainable() -> ChainableEventBus {
    ChainableEventBus::new(fast_bus())
}

/// A bus whose chain is only retry: handler errors escape `publish`.
#[allow(dead_code)]
pub fn unisolated_bus() -> EventBus {
    ember_test::init_test_logging_with("ember_events=debug");
    let chain = MiddlewareChain::new().with(Arc::new(ember_events::RetryMiddleware::new(
        RetryConfig::no_delay(2),
    )));
    EventBus::with_chain(fast_config(10, 100), chain)
}

/// Innermost middleware recording `(handler, attempt)` for every attempt.
#[derive(Debug, Clone, Default)]
#[allow(dead_code)]
pub struct AttemptRecorder {
    attempts: Arc<Mutex<Vec<(String, u32)>>>,
}

#[allow(dead_code)]
impl AttemptRecorder {
    /// Attempts seen so far, in order.
    pub fn attempts(&self) -> Vec<(String, u32)> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Highest attempt number seen for `handler`.
    pub fn last_attempt(&self, handler: &str) -> Option<u32> {
        self.attempts()
            .into_iter()
            .filter(|(name, _)| name == handler)
            .map(|(_, attempt)| attempt)
            .max()
    }
}

#[async_trait]
impl Middleware for AttemptRecorder {
    fn name(&self) -> &str {
        "attempt_recorder"
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> EventResult<bool> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((ctx.handler_name.clone(), ctx.attempt));
        next.run(ctx).await
    }
}
