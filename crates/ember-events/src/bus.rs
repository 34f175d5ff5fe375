//! Base event dispatcher.
//!
//! [`EventBus::publish`] resolves the handlers for an event type, drives each
//! one through the middleware chain under a bus-wide concurrency bound, and
//! decides the event's terminal status once every handler has reported back.
//! Independent handlers run concurrently; dependent handlers run afterwards,
//! one at a time, in dependency order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::context::CancellationSignal;
use crate::error::{EventError, EventResult};
use crate::event::{Event, EventId, EventStatus};
use crate::forwarder::EventForwarder;
use crate::middleware::{
    MetricsMiddleware, Middleware, MiddlewareChain, MiddlewareContext, RetryConfig,
};
use crate::pattern::EventPattern;
use crate::registry::{HandlerInfo, HandlerRegistration, HandlerRegistry};

/// Default bound on concurrent handler invocations across the bus.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 10;
/// Default number of concluded events kept in history.
pub const DEFAULT_MAX_HISTORY_SIZE: usize = 1000;
/// Failure reason recorded when handlers ran but none succeeded.
pub const NO_SUCCESS_REASON: &str = "No handlers processed the event successfully";

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bound on concurrent handler invocations.
    pub max_concurrent_handlers: usize,
    /// Concluded events kept for introspection, oldest evicted first.
    pub max_history_size: usize,
    /// Defaults for the retry middleware.
    pub retry: RetryConfig,
    /// Conversation id for root events that carry none.
    pub default_conversation_id: String,
    /// Agent id for root events that carry none.
    pub default_agent_id: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
            retry: RetryConfig::default(),
            default_conversation_id: "default".to_string(),
            default_agent_id: "unknown".to_string(),
        }
    }
}

/// Point-in-time dispatcher statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Events currently being dispatched.
    pub active_events: usize,
    /// Events in history.
    pub history_size: usize,
    /// History capacity.
    pub max_history_size: usize,
    /// Registered handlers.
    pub registered_handlers: usize,
    /// Enabled handlers.
    pub enabled_handlers: usize,
    /// Concurrency bound.
    pub max_concurrent_handlers: usize,
    /// Free handler slots right now.
    pub available_permits: usize,
    /// Events accepted by `publish`.
    pub published: u64,
    /// Events concluded as completed.
    pub completed: u64,
    /// Events concluded as failed.
    pub failed: u64,
    /// Events concluded as cancelled.
    pub cancelled: u64,
    /// Middleware names, outermost first.
    pub middlewares: Vec<String>,
    /// Registered forwarder names.
    pub forwarders: Vec<String>,
}

#[derive(Debug, Default)]
struct PublishCounters {
    published: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl PublishCounters {
    fn record(&self, status: EventStatus) {
        let counter = match status {
            EventStatus::Completed => &self.completed,
            EventStatus::Failed => &self.failed,
            EventStatus::Cancelled => &self.cancelled,
            EventStatus::Pending | EventStatus::Processing => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of offering one handler to the chain.
enum Invocation {
    /// Cancellation was observed before the handler started.
    Skipped,
    /// The handler ran and reported this result.
    Ran(bool),
}

/// Hierarchical pub/sub dispatcher.
pub struct EventBus {
    config: BusConfig,
    registry: Arc<HandlerRegistry>,
    chain: RwLock<MiddlewareChain>,
    metrics: Option<Arc<MetricsMiddleware>>,
    semaphore: Semaphore,
    active: RwLock<HashMap<EventId, Arc<Event>>>,
    history: RwLock<VecDeque<Arc<Event>>>,
    forwarders: RwLock<Vec<Arc<dyn EventForwarder>>>,
    counters: PublishCounters,
}

impl EventBus {
    /// Create a bus with default configuration and the standard middleware chain.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with the standard middleware chain.
    #[must_use]
    pub fn with_config(config: BusConfig) -> Self {
        let metrics = Arc::new(MetricsMiddleware::new());
        let chain = MiddlewareChain::standard(Arc::clone(&metrics), config.retry.clone());
        Self::build(config, chain, Some(metrics))
    }

    /// Create a bus with a custom middleware chain.
    ///
    /// Without [`ErrorIsolationMiddleware`](crate::ErrorIsolationMiddleware)
    /// in the chain, handler errors escape [`publish`](Self::publish).
    #[must_use]
    pub fn with_chain(config: BusConfig, chain: MiddlewareChain) -> Self {
        Self::build(config, chain, None)
    }

    /// Create a bus with a custom chain that includes `metrics`, keeping a
    /// handle to it for [`metrics`](Self::metrics).
    #[must_use]
    pub fn with_chain_and_metrics(
        config: BusConfig,
        chain: MiddlewareChain,
        metrics: Arc<MetricsMiddleware>,
    ) -> Self {
        Self::build(config, chain, Some(metrics))
    }

    fn build(
        mut config: BusConfig,
        chain: MiddlewareChain,
        metrics: Option<Arc<MetricsMiddleware>>,
    ) -> Self {
        if config.max_concurrent_handlers == 0 {
            warn!("max_concurrent_handlers is 0; using 1");
            config.max_concurrent_handlers = 1;
        }
        if config.max_history_size == 0 {
            warn!("max_history_size is 0; using 1");
            config.max_history_size = 1;
        }

        Self {
            semaphore: Semaphore::new(config.max_concurrent_handlers),
            registry: Arc::new(HandlerRegistry::new()),
            chain: RwLock::new(chain),
            metrics,
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(config.max_history_size.min(1024))),
            forwarders: RwLock::new(Vec::new()),
            counters: PublishCounters::default(),
            config,
        }
    }

    /// Dispatcher configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// The handler registry backing this bus.
    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Metrics collected by the installed metrics middleware.
    ///
    /// `None` for chains built without a metrics handle or once the
    /// middleware has been removed.
    #[must_use]
    pub fn metrics(&self) -> Option<Arc<MetricsMiddleware>> {
        let installed = self
            .chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains("metrics");
        self.metrics.as_ref().filter(|_| installed).map(Arc::clone)
    }

    // ----- Registration façade -----

    /// Register a handler.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`] for a malformed pattern.
    pub fn subscribe(&self, registration: HandlerRegistration) -> EventResult<()> {
        self.registry.register(registration)
    }

    /// Remove a handler. Returns whether it existed.
    pub fn unsubscribe(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    /// Re-enable a handler. Returns whether it exists.
    pub fn enable(&self, name: &str) -> bool {
        self.registry.enable(name)
    }

    /// Disable a handler without removing it. Returns whether it exists.
    pub fn disable(&self, name: &str) -> bool {
        self.registry.disable(name)
    }

    // ----- Middleware -----

    /// Append a middleware (innermost). Returns whether it was added.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) -> bool {
        self.chain
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(middleware)
    }

    /// Remove a middleware by name. Returns whether it was present.
    pub fn remove_middleware(&self, name: &str) -> bool {
        self.chain
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Middleware names, outermost first.
    #[must_use]
    pub fn middleware_names(&self) -> Vec<String> {
        self.chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .names()
    }

    // ----- Forwarders -----

    /// Register a forwarder. A second forwarder with the same name is
    /// rejected. Returns whether it was added.
    pub fn add_forwarder(&self, forwarder: Arc<dyn EventForwarder>) -> bool {
        let mut forwarders = self
            .forwarders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if forwarders.iter().any(|f| f.name() == forwarder.name()) {
            warn!(forwarder = %forwarder.name(), "Forwarder already registered");
            return false;
        }
        debug!(forwarder = %forwarder.name(), "Forwarder registered");
        forwarders.push(forwarder);
        true
    }

    /// Remove a forwarder by name. Returns whether it was present.
    pub fn remove_forwarder(&self, name: &str) -> bool {
        let mut forwarders = self
            .forwarders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = forwarders.len();
        forwarders.retain(|f| f.name() != name);
        forwarders.len() != before
    }

    /// Registered forwarder names.
    #[must_use]
    pub fn forwarder_names(&self) -> Vec<String> {
        self.forwarders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|f| f.name().to_owned())
            .collect()
    }

    // ----- Publishing -----

    /// Dispatch an event to every matching handler.
    ///
    /// Returns `true` if at least one handler processed the event. An event
    /// no handler matched is still marked `Completed` but returns `false`:
    /// use the return value, not the status, to learn whether anything ran.
    ///
    /// # Errors
    ///
    /// Handler errors only escape when the chain lacks error isolation.
    /// Publishing an event that was already dispatched returns
    /// [`EventError::Internal`]. In both cases the event's status reflects
    /// the failure.
    pub async fn publish(&self, event: impl Into<Arc<Event>>) -> EventResult<bool> {
        self.dispatch(event.into(), None).await
    }

    /// Build and publish an event in one step.
    ///
    /// # Errors
    ///
    /// As for [`publish`](Self::publish).
    pub async fn emit(
        &self,
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: Map<String, Value>,
    ) -> EventResult<bool> {
        self.publish(Event::new(event_type, source).with_payload(payload))
            .await
    }

    /// Dispatch with an optional chain cancellation signal.
    pub(crate) async fn dispatch(
        &self,
        event: Arc<Event>,
        signal: Option<CancellationSignal>,
    ) -> EventResult<bool> {
        // The transition itself is the guard, so concurrent publishes of one
        // event cannot both get through.
        if !event.mark_processing() {
            warn!(
                event_id = %event.id(),
                status = %event.status(),
                "Refusing to publish an event that was already dispatched"
            );
            return Err(EventError::Internal(format!(
                "event {} already dispatched (status {})",
                event.id(),
                event.status()
            )));
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let outcome = {
            let _tracked = ActiveEvent::enter(self, &event);
            let outcome = self.run_handlers(&event, signal.as_ref()).await;
            if let Err(e) = &outcome {
                event.mark_failed(e.to_string());
            }
            outcome
        };
        self.forward(&event).await;
        outcome
    }

    async fn run_handlers(
        &self,
        event: &Arc<Event>,
        signal: Option<&CancellationSignal>,
    ) -> EventResult<bool> {
        let resolution = self.registry.resolve(event.event_type());
        if resolution.is_empty() {
            debug!(
                event_id = %event.id(),
                event_type = %event.event_type(),
                "No handlers matched"
            );
            event.mark_completed();
            return Ok(false);
        }

        if let Some(reason) = cancellation_reason(signal) {
            info!(
                event_id = %event.id(),
                event_type = %event.event_type(),
                reason = %reason,
                "Chain cancelled before dispatch"
            );
            event.mark_cancelled(reason);
            return Ok(false);
        }

        let chain = self
            .chain
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut ran: usize = 0;
        let mut succeeded: usize = 0;
        let mut tally = |invocation: Invocation| {
            if let Invocation::Ran(processed) = invocation {
                ran = ran.saturating_add(1);
                if processed {
                    succeeded = succeeded.saturating_add(1);
                }
            }
        };

        let independent = join_all(
            resolution
                .independent
                .iter()
                .map(|info| self.invoke(&chain, event, info, signal)),
        )
        .await;
        for result in independent {
            tally(result?);
        }

        for info in &resolution.dependent {
            tally(self.invoke(&chain, event, info, signal).await?);
        }

        debug!(
            event_id = %event.id(),
            event_type = %event.event_type(),
            matched = resolution.len(),
            ran,
            succeeded,
            "Dispatch finished"
        );

        if succeeded > 0 {
            event.mark_completed();
            return Ok(true);
        }
        match cancellation_reason(signal) {
            Some(reason) if ran == 0 => {
                event.mark_cancelled(reason);
            },
            _ => {
                event.mark_failed(NO_SUCCESS_REASON);
            },
        }
        Ok(false)
    }

    async fn invoke(
        &self,
        chain: &MiddlewareChain,
        event: &Arc<Event>,
        info: &HandlerInfo,
        signal: Option<&CancellationSignal>,
    ) -> EventResult<Invocation> {
        if signal.is_some_and(CancellationSignal::is_cancelled) {
            debug!(event_id = %event.id(), handler = %info.name, "Skipping handler, chain cancelled");
            return Ok(Invocation::Skipped);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| EventError::Internal("handler semaphore closed".to_string()))?;

        // The wait for a slot may have outlived the chain.
        if signal.is_some_and(CancellationSignal::is_cancelled) {
            debug!(event_id = %event.id(), handler = %info.name, "Skipping handler, chain cancelled");
            return Ok(Invocation::Skipped);
        }

        let mut ctx = MiddlewareContext::new(Arc::clone(event), info.name.clone())
            .with_retry_policy(info.retry_policy());
        chain
            .process(&mut ctx, info.handler().as_ref())
            .await
            .map(Invocation::Ran)
    }

    async fn forward(&self, event: &Arc<Event>) {
        let forwarders: Vec<Arc<dyn EventForwarder>> = self
            .forwarders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|f| f.should_forward(event))
            .cloned()
            .collect();

        for forwarder in forwarders {
            if let Err(e) = forwarder.forward(Arc::clone(event)).await {
                warn!(
                    forwarder = %forwarder.name(),
                    event_id = %event.id(),
                    error = %e,
                    "Forwarder failed"
                );
            }
        }
    }

    // ----- Introspection -----

    /// Events currently being dispatched.
    #[must_use]
    pub fn active_events(&self) -> Vec<Arc<Event>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Concluded events, oldest first. `limit` keeps only the most recent.
    #[must_use]
    pub fn history(&self, limit: Option<usize>) -> Vec<Arc<Event>> {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
        history.iter().skip(skip).cloned().collect()
    }

    /// Concluded events whose type matches `pattern`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`] for a malformed pattern.
    pub fn history_for(&self, pattern: &str, limit: Option<usize>) -> EventResult<Vec<Arc<Event>>> {
        let pattern = EventPattern::new(pattern)?;
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<Arc<Event>> = history
            .iter()
            .filter(|e| pattern.matches(e.event_type()))
            .cloned()
            .collect();
        let skip = limit.map_or(0, |n| matched.len().saturating_sub(n));
        Ok(matched.split_off(skip))
    }

    /// Drop all history entries.
    pub fn clear_history(&self) {
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Dispatcher statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            active_events: self
                .active
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            history_size: self
                .history
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            max_history_size: self.config.max_history_size,
            registered_handlers: self.registry.len(),
            enabled_handlers: self.registry.enabled_count(),
            max_concurrent_handlers: self.config.max_concurrent_handlers,
            available_permits: self.semaphore.available_permits(),
            published: self.counters.published.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            middlewares: self.middleware_names(),
            forwarders: self.forwarder_names(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("middlewares", &self.middleware_names())
            .field("forwarders", &self.forwarder_names())
            .finish_non_exhaustive()
    }
}

fn cancellation_reason(signal: Option<&CancellationSignal>) -> Option<String> {
    signal.filter(|s| s.is_cancelled()).map(|s| {
        s.reason()
            .map_or_else(|| "chain cancelled".to_string(), str::to_owned)
    })
}

/// Tracks an event in the active map for the duration of a dispatch.
///
/// On drop the event leaves the active map and enters history, including
/// when the publishing future is dropped mid-dispatch.
struct ActiveEvent<'a> {
    bus: &'a EventBus,
    event: &'a Arc<Event>,
}

impl<'a> ActiveEvent<'a> {
    fn enter(bus: &'a EventBus, event: &'a Arc<Event>) -> Self {
        bus.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.id(), Arc::clone(event));
        Self { bus, event }
    }
}

impl Drop for ActiveEvent<'_> {
    fn drop(&mut self) {
        if !self.event.status().is_terminal() {
            self.event.mark_cancelled("dispatch abandoned");
        }

        self.bus
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.event.id());
        self.bus.counters.record(self.event.status());

        let mut history = self
            .bus
            .history
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.bus.config.max_history_size {
            history.pop_front();
        }
        history.push_back(Arc::clone(self.event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::BroadcastForwarder;
    use crate::handler::{async_handler_fn, handler_fn};
    use crate::middleware::{ErrorIsolationMiddleware, RetryMiddleware};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn quick_config() -> BusConfig {
        BusConfig {
            retry: RetryConfig::no_delay(3),
            ..BusConfig::default()
        }
    }

    fn quick_bus() -> EventBus {
        EventBus::with_config(quick_config())
    }

    fn order_recorder(name: &str, log: &Arc<Mutex<Vec<String>>>) -> crate::handler::Handler {
        let name = name.to_string();
        let log = Arc::clone(log);
        handler_fn(move |_| {
            log.lock().unwrap().push(name.clone());
            Ok(true)
        })
    }

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.max_concurrent_handlers, 10);
        assert_eq!(config.max_history_size, 1000);
        assert_eq!(config.default_conversation_id, "default");
        assert_eq!(config.default_agent_id, "unknown");
    }

    #[test]
    fn test_standard_chain_installed() {
        let bus = EventBus::new();
        assert_eq!(
            bus.middleware_names(),
            vec!["logging", "metrics", "error_isolation", "retry"]
        );
        assert!(bus.metrics().is_some());

        assert!(bus.remove_middleware("metrics"));
        assert!(bus.metrics().is_none());
    }

    #[tokio::test]
    async fn test_echo_scenario() {
        let bus = quick_bus();
        bus.subscribe(HandlerRegistration::new("echo", handler_fn(|_| Ok(true))).pattern("test.*"))
            .unwrap();

        let event = Arc::new(Event::new("test.ping", "tests").with_field("x", 1));
        assert!(bus.publish(Arc::clone(&event)).await.unwrap());
        assert_eq!(event.status(), EventStatus::Completed);
        assert_eq!(event.processed_by(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_no_handlers_completes_but_returns_false() {
        let bus = quick_bus();
        let event = Arc::new(Event::new("unknown.event", "tests"));

        assert!(!bus.publish(Arc::clone(&event)).await.unwrap());
        assert_eq!(event.status(), EventStatus::Completed);
        assert!(event.processed_by().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_order() {
        let bus = quick_bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(HandlerRegistration::new("h1", order_recorder("h1", &log)).pattern("order.*"))
            .unwrap();
        bus.subscribe(
            HandlerRegistration::new("h2", order_recorder("h2", &log))
                .pattern("order.*")
                .depends_on("h1"),
        )
        .unwrap();

        assert!(bus.publish(Event::new("order.created", "tests")).await.unwrap());
        assert_eq!(*log.lock().unwrap(), vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn test_all_failing_handlers_mark_failed() {
        let bus = quick_bus();
        bus.subscribe(
            HandlerRegistration::new("broken", handler_fn(|_| Err(EventError::handler("boom"))))
                .pattern("job.*"),
        )
        .unwrap();
        bus.subscribe(HandlerRegistration::new("declines", handler_fn(|_| Ok(false))).pattern("job.*"))
            .unwrap();

        let event = Arc::new(Event::new("job.run", "tests"));
        assert!(!bus.publish(Arc::clone(&event)).await.unwrap());
        assert_eq!(event.status(), EventStatus::Failed);
        assert_eq!(event.error().as_deref(), Some(NO_SUCCESS_REASON));
        assert_eq!(event.handler_errors(), vec!["broken: handler error: boom"]);
    }

    #[tokio::test]
    async fn test_one_success_is_enough() {
        let bus = quick_bus();
        bus.subscribe(
            HandlerRegistration::new("broken", handler_fn(|_| Err(EventError::handler("boom"))))
                .pattern("job.*"),
        )
        .unwrap();
        bus.subscribe(HandlerRegistration::new("ok", handler_fn(|_| Ok(true))).pattern("job.*"))
            .unwrap();

        let event = Arc::new(Event::new("job.run", "tests"));
        assert!(bus.publish(Arc::clone(&event)).await.unwrap());
        assert_eq!(event.status(), EventStatus::Completed);
        assert_eq!(event.handler_errors().len(), 1);
    }

    #[tokio::test]
    async fn test_error_escapes_without_isolation() {
        let chain = MiddlewareChain::new().with(Arc::new(RetryMiddleware::new(RetryConfig::no_delay(2))));
        let bus = EventBus::with_chain(quick_config(), chain);
        bus.subscribe(
            HandlerRegistration::new("broken", handler_fn(|_| Err(EventError::handler("boom"))))
                .pattern("*"),
        )
        .unwrap();

        let event = Arc::new(Event::new("any.thing", "tests"));
        let err = bus.publish(Arc::clone(&event)).await.unwrap_err();
        assert_eq!(err, EventError::handler("boom"));
        assert_eq!(event.status(), EventStatus::Failed);
        assert!(bus.active_events().is_empty());
        assert_eq!(bus.history(None).len(), 1);
    }

    #[tokio::test]
    async fn test_isolation_without_retry() {
        let chain = MiddlewareChain::new().with(Arc::new(ErrorIsolationMiddleware::new()));
        let bus = EventBus::with_chain(quick_config(), chain);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.subscribe(
            HandlerRegistration::new(
                "broken",
                handler_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EventError::handler("boom"))
                }),
            )
            .pattern("*"),
        )
        .unwrap();

        assert!(!bus.publish(Event::new("x", "tests")).await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_republish_is_rejected() {
        let bus = quick_bus();
        let event = Arc::new(Event::new("a", "tests"));
        bus.publish(Arc::clone(&event)).await.unwrap();

        assert!(matches!(
            bus.publish(Arc::clone(&event)).await,
            Err(EventError::Internal(_))
        ));
        assert_eq!(bus.history(None).len(), 1);
        assert_eq!(bus.stats().published, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publish_of_one_event_dispatches_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let bus = Arc::new(quick_bus());
        bus.subscribe(
            HandlerRegistration::new(
                "count",
                handler_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }),
            )
            .pattern("race.*"),
        )
        .unwrap();

        let event = Arc::new(Event::new("race.start", "tests"));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let bus = Arc::clone(&bus);
                let event = Arc::clone(&event);
                tokio::spawn(async move { bus.publish(event).await })
            })
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().published, 1);
        assert_eq!(event.processed_by(), vec!["count"]);
    }

    #[tokio::test]
    async fn test_event_already_processing_is_rejected() {
        let bus = quick_bus();
        let event = Arc::new(Event::new("a", "tests"));
        assert!(event.mark_processing());

        assert!(matches!(
            bus.publish(Arc::clone(&event)).await,
            Err(EventError::Internal(_))
        ));
        assert_eq!(event.status(), EventStatus::Processing);
        assert_eq!(bus.stats().published, 0);
        assert!(bus.history(None).is_empty());
    }

    #[tokio::test]
    async fn test_history_evicts_oldest() {
        let bus = EventBus::with_config(BusConfig {
            max_history_size: 3,
            ..quick_config()
        });

        for i in 0..4 {
            bus.publish(Event::new(format!("seq.{i}"), "tests"))
                .await
                .unwrap();
        }

        let types: Vec<String> = bus
            .history(None)
            .iter()
            .map(|e| e.event_type().to_owned())
            .collect();
        assert_eq!(types, vec!["seq.1", "seq.2", "seq.3"]);
        assert_eq!(bus.history(Some(1))[0].event_type(), "seq.3");
    }

    #[tokio::test]
    async fn test_history_for_pattern() {
        let bus = quick_bus();
        bus.publish(Event::new("order.created", "t")).await.unwrap();
        bus.publish(Event::new("user.login", "t")).await.unwrap();
        bus.publish(Event::new("order.paid", "t")).await.unwrap();

        let orders = bus.history_for("order.*", None).unwrap();
        assert_eq!(orders.len(), 2);
        let last = bus.history_for("order.*", Some(1)).unwrap();
        assert_eq!(last[0].event_type(), "order.paid");
        assert!(bus.history_for("bad.[", None).is_err());

        bus.clear_history();
        assert!(bus.history(None).is_empty());
    }

    #[tokio::test]
    async fn test_active_events_visible_during_dispatch() {
        let bus = Arc::new(quick_bus());
        let seen = Arc::new(AtomicUsize::new(0));
        let probe_bus = Arc::downgrade(&bus);
        let probe_seen = Arc::clone(&seen);
        bus.subscribe(
            HandlerRegistration::new(
                "probe",
                handler_fn(move |_| {
                    if let Some(bus) = probe_bus.upgrade() {
                        probe_seen.store(bus.active_events().len(), Ordering::SeqCst);
                    }
                    Ok(true)
                }),
            )
            .pattern("*"),
        )
        .unwrap();

        bus.publish(Event::new("a", "t")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(bus.active_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_semaphore_bounds_concurrency() {
        let bus = EventBus::with_config(BusConfig {
            max_concurrent_handlers: 2,
            ..quick_config()
        });
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            bus.subscribe(
                HandlerRegistration::new(
                    format!("worker{i}"),
                    async_handler_fn(move |_| {
                        let in_flight = Arc::clone(&in_flight);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok(true)
                        }
                    }),
                )
                .pattern("work.*"),
            )
            .unwrap();
        }

        let event = Arc::new(Event::new("work.batch", "t"));
        assert!(bus.publish(Arc::clone(&event)).await.unwrap());
        assert_eq!(event.processed_by().len(), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().available_permits, 2);
    }

    #[tokio::test]
    async fn test_forwarded_once_regardless_of_handler_count() {
        let bus = quick_bus();
        for name in ["a", "b", "c"] {
            bus.subscribe(HandlerRegistration::new(name, handler_fn(|_| Ok(true))).pattern("ui.*"))
                .unwrap();
        }
        let forwarder = Arc::new(BroadcastForwarder::new("ws", ["ui.*"]).unwrap());
        let mut rx = forwarder.subscribe();
        assert!(bus.add_forwarder(forwarder.clone()));
        assert!(!bus.add_forwarder(forwarder));

        bus.publish(Event::new("ui.refresh", "t")).await.unwrap();
        bus.publish(Event::new("db.write", "t")).await.unwrap();

        let got = rx.try_recv().unwrap();
        assert_eq!(got.event_type(), "ui.refresh");
        assert_eq!(got.status(), EventStatus::Completed);
        assert!(rx.try_recv().is_none());

        assert!(bus.remove_forwarder("ws"));
        assert!(bus.forwarder_names().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_dispatch_lands_in_history() {
        let bus = quick_bus();
        let gate = Arc::new(tokio::sync::Notify::new());
        let wait = Arc::clone(&gate);
        bus.subscribe(
            HandlerRegistration::new(
                "stuck",
                async_handler_fn(move |_| {
                    let wait = Arc::clone(&wait);
                    async move {
                        wait.notified().await;
                        Ok(true)
                    }
                }),
            )
            .pattern("*"),
        )
        .unwrap();

        let event = Arc::new(Event::new("slow", "t"));
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), bus.publish(Arc::clone(&event))).await;
        assert!(timed_out.is_err());

        assert_eq!(event.status(), EventStatus::Cancelled);
        assert!(bus.active_events().is_empty());
        assert_eq!(bus.history(None).len(), 1);
        assert_eq!(bus.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_stats_counts_outcomes() {
        let bus = quick_bus();
        bus.subscribe(HandlerRegistration::new("ok", handler_fn(|_| Ok(true))).pattern("good"))
            .unwrap();
        bus.subscribe(HandlerRegistration::new("no", handler_fn(|_| Ok(false))).pattern("bad"))
            .unwrap();

        bus.publish(Event::new("good", "t")).await.unwrap();
        bus.publish(Event::new("bad", "t")).await.unwrap();
        bus.emit("good", "t", Map::new()).await.unwrap();

        let stats = bus.stats();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.registered_handlers, 2);
        assert_eq!(stats.history_size, 3);

        let metrics = bus.metrics().unwrap().snapshot();
        assert_eq!(metrics.handlers["ok"].successes, 2);
        assert_eq!(metrics.handlers["no"].failures, 1);
    }

    #[tokio::test]
    async fn test_custom_chain_keeps_metrics_handle() {
        let metrics = Arc::new(MetricsMiddleware::new());
        let chain = MiddlewareChain::new()
            .with(Arc::clone(&metrics) as Arc<dyn Middleware>)
            .with(Arc::new(ErrorIsolationMiddleware::new()));
        let bus = EventBus::with_chain_and_metrics(BusConfig::default(), chain, metrics);
        bus.subscribe(HandlerRegistration::new("ok", handler_fn(|_| Ok(true))).pattern("*"))
            .unwrap();

        assert!(bus.publish(Event::new("a", "t")).await.unwrap());
        assert_eq!(bus.metrics().unwrap().snapshot().handlers["ok"].total, 1);

        assert!(bus.remove_middleware("metrics"));
        assert!(bus.metrics().is_none());
    }
}
