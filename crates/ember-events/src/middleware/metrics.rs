//! Per-handler and per-event-type invocation counters.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{Middleware, MiddlewareContext, Next};
use crate::error::EventResult;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total: u64,
    successes: u64,
    failures: u64,
    total_duration: Duration,
}

impl Counters {
    fn record(&mut self, success: bool, duration: Duration) {
        self.total = self.total.saturating_add(1);
        if success {
            self.successes = self.successes.saturating_add(1);
        } else {
            self.failures = self.failures.saturating_add(1);
        }
        self.total_duration = self.total_duration.saturating_add(duration);
    }

    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self) -> HandlerStats {
        let avg_duration_ms = if self.total == 0 {
            0.0
        } else {
            self.total_duration.as_secs_f64() * 1000.0 / self.total as f64
        };
        HandlerStats {
            total: self.total,
            successes: self.successes,
            failures: self.failures,
            avg_duration_ms,
        }
    }
}

/// Aggregated counters for one handler or event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerStats {
    /// Invocations observed.
    pub total: u64,
    /// Invocations that returned `true`.
    pub successes: u64,
    /// Invocations that returned `false` or failed.
    pub failures: u64,
    /// Mean invocation time in milliseconds.
    pub avg_duration_ms: f64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Keyed by handler name.
    pub handlers: BTreeMap<String, HandlerStats>,
    /// Keyed by event type.
    pub event_types: BTreeMap<String, HandlerStats>,
}

/// Counts invocations, outcomes and durations.
///
/// Counters live in sharded maps, so concurrent invocations for the same
/// handler or event type update them without a global lock.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    handlers: DashMap<String, Counters>,
    event_types: DashMap<String, Counters>,
}

impl MetricsMiddleware {
    /// Create an empty metrics collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out the current counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            handlers: self
                .handlers
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
            event_types: self
                .event_types
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
        }
    }

    /// Counters for one handler.
    #[must_use]
    pub fn handler_stats(&self, handler: &str) -> Option<HandlerStats> {
        self.handlers.get(handler).map(|c| c.snapshot())
    }

    /// Counters for one event type.
    #[must_use]
    pub fn event_type_stats(&self, event_type: &str) -> Option<HandlerStats> {
        self.event_types.get(event_type).map(|c| c.snapshot())
    }

    /// Drop all counters.
    pub fn reset(&self) {
        self.handlers.clear();
        self.event_types.clear();
    }

    fn record(&self, handler: &str, event_type: &str, success: bool, duration: Duration) {
        self.handlers
            .entry(handler.to_owned())
            .or_default()
            .record(success, duration);
        self.event_types
            .entry(event_type.to_owned())
            .or_default()
            .record(success, duration);
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> EventResult<bool> {
        let result = next.run(ctx).await;
        let success = matches!(result, Ok(true));
        self.record(
            &ctx.handler_name,
            ctx.event.event_type(),
            success,
            ctx.elapsed(),
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EventError;
    use crate::event::Event;
    use crate::handler::handler_fn;
    use crate::middleware::MiddlewareChain;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_counts_successes_and_failures() {
        let metrics = Arc::new(MetricsMiddleware::new());
        let chain = MiddlewareChain::new().with(metrics.clone());
        let event = Arc::new(Event::new("order.created", "tests"));

        let ok = handler_fn(|_| Ok(true));
        let no = handler_fn(|_| Ok(false));
        let err = handler_fn(|_| Err(EventError::handler("x")));

        for _ in 0..3 {
            let mut ctx = MiddlewareContext::new(Arc::clone(&event), "ok");
            chain.process(&mut ctx, ok.as_ref()).await.unwrap();
        }
        let mut ctx = MiddlewareContext::new(Arc::clone(&event), "no");
        chain.process(&mut ctx, no.as_ref()).await.unwrap();
        let mut ctx = MiddlewareContext::new(Arc::clone(&event), "err");
        assert!(chain.process(&mut ctx, err.as_ref()).await.is_err());

        let ok_stats = metrics.handler_stats("ok").unwrap();
        assert_eq!(ok_stats.total, 3);
        assert_eq!(ok_stats.successes, 3);
        assert_eq!(ok_stats.failures, 0);

        assert_eq!(metrics.handler_stats("no").unwrap().failures, 1);
        assert_eq!(metrics.handler_stats("err").unwrap().failures, 1);

        let by_type = metrics.event_type_stats("order.created").unwrap();
        assert_eq!(by_type.total, 5);
        assert_eq!(by_type.successes, 3);
        assert_eq!(by_type.failures, 2);
        assert!(by_type.avg_duration_ms >= 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_are_not_lost() {
        let metrics = Arc::new(MetricsMiddleware::new());
        let chain = Arc::new(MiddlewareChain::new().with(metrics.clone()));
        let handler = handler_fn(|_| Ok(true));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let chain = Arc::clone(&chain);
            let handler = Arc::clone(&handler);
            tasks.push(tokio::spawn(async move {
                let event = Arc::new(Event::new("load.test", "tests"));
                let mut ctx = MiddlewareContext::new(event, "shared");
                chain.process(&mut ctx, handler.as_ref()).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(metrics.handler_stats("shared").unwrap().total, 50);
        assert_eq!(metrics.snapshot().event_types["load.test"].successes, 50);
    }

    #[test]
    fn test_reset() {
        let metrics = MetricsMiddleware::new();
        metrics.record("h", "t", true, Duration::from_millis(4));
        metrics.record("h", "t", false, Duration::from_millis(2));
        let stats = metrics.handler_stats("h").unwrap();
        assert!((stats.avg_duration_ms - 3.0).abs() < 1e-6);

        metrics.reset();
        assert!(metrics.snapshot().handlers.is_empty());
    }
}
