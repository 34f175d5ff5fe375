//! Handler, middleware and forwarder doubles.
//!
//! Every double is cheap to clone and shares its recorded state between
//! clones, so a test keeps one copy for assertions and registers another.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use ember_events::{
    Event, EventError, EventForwarder, EventHandler, EventPattern, EventResult, EventSnapshot,
    Handler, Middleware, MiddlewareContext, Next, any_matches, compile_patterns,
};
use tokio::sync::Notify;

/// Shared, ordered log of calls, used to assert execution order across
/// several handlers and middlewares.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    /// Snapshot of all entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Position of the first entry equal to `entry`.
    #[must_use]
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .position(|e| e == entry)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// ---------------------------------------------------------------------------
// RecordingHandler
// ---------------------------------------------------------------------------

/// Records every event it sees and returns a fixed outcome.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    name: String,
    outcome: bool,
    seen: Arc<Mutex<Vec<Arc<Event>>>>,
    log: Option<CallLog>,
}

impl RecordingHandler {
    /// A handler that returns `Ok(true)`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: true,
            seen: Arc::new(Mutex::new(Vec::new())),
            log: None,
        }
    }

    /// Return `Ok(outcome)` instead of `Ok(true)`.
    #[must_use]
    pub fn returning(mut self, outcome: bool) -> Self {
        self.outcome = outcome;
        self
    }

    /// Also push this handler's name onto `log` on every call.
    #[must_use]
    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    /// The handler as a registrable [`Handler`].
    #[must_use]
    pub fn handler(&self) -> Handler {
        Arc::new(self.clone())
    }

    /// Number of calls.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Every event seen, in call order.
    #[must_use]
    pub fn events(&self) -> Vec<Arc<Event>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Types of every event seen, in call order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e.event_type().to_owned())
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Arc<Event>) -> EventResult<bool> {
        if let Some(log) = &self.log {
            log.push(self.name.as_str());
        }
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(event));
        Ok(self.outcome)
    }
}

// ---------------------------------------------------------------------------
// FlakyHandler
// ---------------------------------------------------------------------------

/// Fails a fixed number of times, then succeeds.
#[derive(Debug, Clone)]
pub struct FlakyHandler {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyHandler {
    /// Fail the first `failures` calls with a handler error.
    #[must_use]
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The handler as a registrable [`Handler`].
    #[must_use]
    pub fn handler(&self) -> Handler {
        Arc::new(self.clone())
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(&self, _event: &Arc<Event>) -> EventResult<bool> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if call <= self.failures {
            return Err(EventError::handler(format!("flaky failure {call}")));
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// FailingHandler
// ---------------------------------------------------------------------------

/// Always fails, either with an error or a panic.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    message: String,
    panics: bool,
    calls: Arc<AtomicUsize>,
}

impl FailingHandler {
    /// Return `Err(EventError::Handler(message))` on every call.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panics: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Panic with `message` on every call.
    #[must_use]
    pub fn panicking(message: impl Into<String>) -> Self {
        Self {
            panics: true,
            ..Self::new(message)
        }
    }

    /// The handler as a registrable [`Handler`].
    #[must_use]
    pub fn handler(&self) -> Handler {
        Arc::new(self.clone())
    }

    /// Number of calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    #[allow(clippy::panic)]
    async fn handle(&self, _event: &Arc<Event>) -> EventResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("{}", self.message);
        }
        Err(EventError::handler(self.message.clone()))
    }
}

// ---------------------------------------------------------------------------
// SlowHandler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Pace {
    Gate(Arc<Notify>),
    Sleep(Duration),
}

/// Holds each call open until released, tracking how many calls overlap.
#[derive(Debug, Clone)]
pub struct SlowHandler {
    pace: Pace,
    started: Arc<Notify>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SlowHandler {
    /// Each call waits for one [`release`](Self::release).
    #[must_use]
    pub fn gated() -> Self {
        Self::with_pace(Pace::Gate(Arc::new(Notify::new())))
    }

    /// Each call sleeps for `delay`.
    #[must_use]
    pub fn sleeping(delay: Duration) -> Self {
        Self::with_pace(Pace::Sleep(delay))
    }

    fn with_pace(pace: Pace) -> Self {
        Self {
            pace,
            started: Arc::new(Notify::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The handler as a registrable [`Handler`].
    #[must_use]
    pub fn handler(&self) -> Handler {
        Arc::new(self.clone())
    }

    /// Let one waiting (or the next) call finish. No-op for sleeping handlers.
    pub fn release(&self) {
        if let Pace::Gate(gate) = &self.pace {
            gate.notify_one();
        }
    }

    /// Wait until some call has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Number of calls started so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Largest number of calls that ran at the same time.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for SlowHandler {
    async fn handle(&self, _event: &Arc<Event>) -> EventResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.started.notify_one();

        match &self.pace {
            Pace::Gate(gate) => gate.notified().await,
            Pace::Sleep(delay) => tokio::time::sleep(*delay).await,
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// ProbeMiddleware
// ---------------------------------------------------------------------------

/// Middleware that logs `<name>:before:<handler>` and `<name>:after:<handler>`
/// around the rest of the chain, or short-circuits it.
#[derive(Debug, Clone)]
pub struct ProbeMiddleware {
    name: String,
    log: CallLog,
    short_circuit: Option<bool>,
}

impl ProbeMiddleware {
    /// A pass-through probe.
    #[must_use]
    pub fn new(name: impl Into<String>, log: &CallLog) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
            short_circuit: None,
        }
    }

    /// Return `Ok(outcome)` without running the rest of the chain.
    #[must_use]
    pub fn short_circuit(mut self, outcome: bool) -> Self {
        self.short_circuit = Some(outcome);
        self
    }

    /// The probe as a chain member.
    #[must_use]
    pub fn middleware(&self) -> Arc<dyn Middleware> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl Middleware for ProbeMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> EventResult<bool> {
        self.log
            .push(format!("{}:before:{}", self.name, ctx.handler_name));
        if let Some(outcome) = self.short_circuit {
            return Ok(outcome);
        }
        let result = next.run(ctx).await;
        self.log.push(format!("{}:after:{}", self.name, ctx.handler_name));
        result
    }
}

// ---------------------------------------------------------------------------
// RecordingForwarder
// ---------------------------------------------------------------------------

/// Forwarder that keeps a snapshot of everything it is handed.
#[derive(Debug, Clone)]
pub struct RecordingForwarder {
    name: String,
    patterns: Vec<EventPattern>,
    fails: bool,
    forwarded: Arc<Mutex<Vec<EventSnapshot>>>,
}

impl RecordingForwarder {
    /// Forward every event type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patterns: vec![EventPattern::any()],
            fails: false,
            forwarded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Forward only types matching `patterns`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`] for a malformed pattern.
    pub fn with_patterns<I, S>(mut self, patterns: I) -> EventResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = compile_patterns(patterns)?;
        Ok(self)
    }

    /// Record the event, then report a transport failure.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fails = true;
        self
    }

    /// The forwarder as a bus member.
    #[must_use]
    pub fn forwarder(&self) -> Arc<dyn EventForwarder> {
        Arc::new(self.clone())
    }

    /// Snapshots of forwarded events, in order.
    #[must_use]
    pub fn forwarded(&self) -> Vec<EventSnapshot> {
        self.forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of forwarded events.
    #[must_use]
    pub fn count(&self) -> usize {
        self.forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl EventForwarder for RecordingForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_forward(&self, event: &Event) -> bool {
        any_matches(&self.patterns, event.event_type())
    }

    async fn forward(&self, event: Arc<Event>) -> EventResult<()> {
        self.forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.snapshot());
        if self.fails {
            return Err(EventError::ForwardFailed {
                forwarder: self.name.clone(),
                reason: "recording forwarder set to fail".to_owned(),
            });
        }
        Ok(())
    }
}
