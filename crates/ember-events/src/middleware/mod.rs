//! Middleware around handler invocation.
//!
//! A [`MiddlewareChain`] is an ordered list of [`Middleware`]s, outermost
//! first. Each middleware receives the per-invocation [`MiddlewareContext`]
//! and a [`Next`] continuation; it may act before or after calling
//! [`Next::run`], call it several times (retry), or not at all. The chain
//! bottoms out in the handler itself.
//!
//! The standard chain is `Logging → Metrics → ErrorIsolation → Retry`.
//! Error isolation sits outside retry, so the error from the last exhausted
//! attempt is swallowed there rather than escaping `publish()`.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::warn;

use crate::error::{EventError, EventResult};
use crate::event::Event;
use crate::handler::EventHandler;

mod isolation;
mod logging;
mod metrics;
mod retry;

pub use isolation::ErrorIsolationMiddleware;
pub use logging::LoggingMiddleware;
pub use metrics::{HandlerStats, MetricsMiddleware, MetricsSnapshot};
pub use retry::{RetryConfig, RetryMiddleware};

/// Per-invocation state shared along one handler's middleware chain.
///
/// Created fresh for every (event, handler) pairing and dropped afterwards.
#[derive(Debug)]
pub struct MiddlewareContext {
    /// The event being dispatched.
    pub event: Arc<Event>,
    /// Name of the handler being invoked.
    pub handler_name: String,
    /// Current attempt, starting at 1.
    pub attempt: u32,
    /// When this invocation started.
    pub started_at: Instant,
    /// Per-handler retry override (attempts, base delay).
    pub retry_policy: Option<(u32, Duration)>,
    /// Scratch space for middlewares.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MiddlewareContext {
    /// Create a context for invoking `handler_name` on `event`.
    pub fn new(event: Arc<Event>, handler_name: impl Into<String>) -> Self {
        Self {
            event,
            handler_name: handler_name.into(),
            attempt: 1,
            started_at: Instant::now(),
            retry_policy: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach a per-handler retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: Option<(u32, Duration)>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Time since the invocation started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// A cross-cutting wrapper around handler invocation.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Unique middleware name; a chain holds at most one per name.
    fn name(&self) -> &str;

    /// Process one invocation, usually by calling `next.run(ctx)`.
    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> EventResult<bool>;
}

/// Continuation into the rest of the chain.
///
/// `Next` is `Copy`, so a middleware can run the remainder of the chain more
/// than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    handler: &'a dyn EventHandler,
}

impl<'a> Next<'a> {
    /// Run the remaining middlewares and then the handler.
    pub fn run<'b>(self, ctx: &'b mut MiddlewareContext) -> BoxFuture<'b, EventResult<bool>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.middlewares.split_first() {
                Some((head, rest)) => {
                    let next = Next {
                        middlewares: rest,
                        handler: self.handler,
                    };
                    head.process(ctx, next).await
                },
                None => invoke_handler(self.handler, ctx).await,
            }
        })
    }
}

/// Invoke the handler, recording it on the event and turning panics into errors.
async fn invoke_handler(
    handler: &dyn EventHandler,
    ctx: &mut MiddlewareContext,
) -> EventResult<bool> {
    ctx.event.record_processed_by(&ctx.handler_name);
    match AssertUnwindSafe(handler.handle(&ctx.event))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(EventError::HandlerPanicked {
            handler: ctx.handler_name.clone(),
            message: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Ordered middleware stack, outermost first.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// Create an empty chain; handlers are invoked directly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard chain: `Logging → Metrics → ErrorIsolation → Retry`.
    #[must_use]
    pub fn standard(metrics: Arc<MetricsMiddleware>, retry: RetryConfig) -> Self {
        Self::new()
            .with(Arc::new(LoggingMiddleware::new()))
            .with(metrics)
            .with(Arc::new(ErrorIsolationMiddleware::new()))
            .with(Arc::new(RetryMiddleware::new(retry)))
    }

    /// Append a middleware (innermost so far).
    ///
    /// A middleware whose name is already present is rejected with a warning;
    /// the first registration wins. Returns whether it was added.
    pub fn add(&mut self, middleware: Arc<dyn Middleware>) -> bool {
        if self.contains(middleware.name()) {
            warn!(
                middleware = %middleware.name(),
                "Middleware already in chain; keeping the existing one"
            );
            return false;
        }
        self.middlewares.push(middleware);
        true
    }

    /// Builder form of [`add`](Self::add).
    #[must_use]
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add(middleware);
        self
    }

    /// Remove a middleware by name. Returns whether one was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.middlewares.len();
        self.middlewares.retain(|m| m.name() != name);
        self.middlewares.len() != before
    }

    /// Whether a middleware with this name is in the chain.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.middlewares.iter().any(|m| m.name() == name)
    }

    /// Middleware names, outermost first.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.middlewares.iter().map(|m| m.name().to_owned()).collect()
    }

    /// Number of middlewares.
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Drive one handler invocation through the chain.
    ///
    /// # Errors
    ///
    /// Returns whatever error reaches the outermost middleware; with the
    /// standard chain, handler errors are absorbed by error isolation.
    pub async fn process(
        &self,
        ctx: &mut MiddlewareContext,
        handler: &dyn EventHandler,
    ) -> EventResult<bool> {
        let next = Next {
            middlewares: &self.middlewares,
            handler,
        };
        next.run(ctx).await
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain")
            .field("middlewares", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{async_handler_fn, handler_fn};
    use std::sync::Mutex;

    /// Records entry/exit into a shared trace.
    struct Tracer {
        name: String,
        trace: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Tracer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> EventResult<bool> {
            self.trace.lock().unwrap().push(format!("{}:before", self.name));
            let result = next.run(ctx).await;
            self.trace.lock().unwrap().push(format!("{}:after", self.name));
            result
        }
    }

    /// Never calls the rest of the chain.
    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        fn name(&self) -> &str {
            "short_circuit"
        }

        async fn process(&self, _ctx: &mut MiddlewareContext, _next: Next<'_>) -> EventResult<bool> {
            Ok(false)
        }
    }

    fn tracer(name: &str, trace: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(Tracer {
            name: name.to_string(),
            trace: Arc::clone(trace),
        })
    }

    fn ctx(handler: &str) -> MiddlewareContext {
        MiddlewareContext::new(Arc::new(Event::new("test.event", "tests")), handler)
    }

    #[tokio::test]
    async fn test_empty_chain_calls_handler_directly() {
        let chain = MiddlewareChain::new();
        let handler = handler_fn(|_| Ok(true));
        let mut ctx = ctx("direct");

        assert!(chain.process(&mut ctx, handler.as_ref()).await.unwrap());
        assert_eq!(ctx.event.processed_by(), vec!["direct"]);
    }

    #[tokio::test]
    async fn test_chain_order_is_outermost_first() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new()
            .with(tracer("outer", &trace))
            .with(tracer("inner", &trace));

        let handler_trace = Arc::clone(&trace);
        let handler = handler_fn(move |_| {
            handler_trace.lock().unwrap().push("handler".to_string());
            Ok(true)
        });

        let mut ctx = ctx("h");
        assert!(chain.process(&mut ctx, handler.as_ref()).await.unwrap());
        assert_eq!(
            *trace.lock().unwrap(),
            vec![
                "outer:before",
                "inner:before",
                "handler",
                "inner:after",
                "outer:after"
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected_first_wins() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        assert!(chain.add(tracer("dup", &trace)));
        assert!(chain.add(Arc::new(ShortCircuit)));
        assert!(!chain.add(tracer("dup", &trace)));
        assert_eq!(chain.names(), vec!["dup", "short_circuit"]);

        assert!(chain.remove("short_circuit"));
        assert!(!chain.remove("short_circuit"));
        assert_eq!(chain.names(), vec!["dup"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let chain = MiddlewareChain::new().with(Arc::new(ShortCircuit));
        let handler = handler_fn(|_| panic!("must not run"));
        let mut ctx = ctx("skipped");

        assert!(!chain.process(&mut ctx, handler.as_ref()).await.unwrap());
        assert!(ctx.event.processed_by().is_empty());
    }

    #[tokio::test]
    async fn test_async_and_sync_handlers_behave_alike() {
        let chain = MiddlewareChain::new();
        let sync = handler_fn(|_| Ok(true));
        let asynchronous = async_handler_fn(|_| async {
            tokio::task::yield_now().await;
            Ok(true)
        });

        assert!(chain.process(&mut ctx("s"), sync.as_ref()).await.unwrap());
        assert!(
            chain
                .process(&mut ctx("a"), asynchronous.as_ref())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_error() {
        let chain = MiddlewareChain::new();
        let handler = handler_fn(|_| panic!("kaboom"));
        let mut ctx = ctx("panicky");

        let err = chain.process(&mut ctx, handler.as_ref()).await.unwrap_err();
        assert_eq!(
            err,
            EventError::HandlerPanicked {
                handler: "panicky".to_string(),
                message: "kaboom".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_standard_chain_order() {
        let chain = MiddlewareChain::standard(
            Arc::new(MetricsMiddleware::new()),
            RetryConfig::no_delay(3),
        );
        assert_eq!(
            chain.names(),
            vec!["logging", "metrics", "error_isolation", "retry"]
        );
    }
}
