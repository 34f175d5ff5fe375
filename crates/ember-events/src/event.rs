//! Event record and dispatch state machine.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::context::{ContextSnapshot, EventContext};

/// Metadata key read for a root event's conversation id.
pub const CONVERSATION_ID_KEY: &str = "conversation_id";
/// Metadata key read for a root event's agent id.
pub const AGENT_ID_KEY: &str = "agent_id";
/// Metadata key set on child events pointing at their parent.
pub const PARENT_EVENT_ID_KEY: &str = "parent_event_id";

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch status of an event.
///
/// `Pending → Processing → {Completed | Failed}`, with `Cancelled` reachable
/// from `Pending` or `Processing`. No state is ever revisited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Created, not yet dispatched.
    #[default]
    Pending,
    /// Handlers are running.
    Processing,
    /// Dispatch finished (possibly with no handlers).
    Completed,
    /// No handler succeeded, or dispatch faulted.
    Failed,
    /// Dispatch was aborted by a chain cancellation.
    Cancelled,
}

impl EventStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending | Self::Processing, Self::Cancelled)
                | (Self::Processing, Self::Completed | Self::Failed)
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    status: EventStatus,
    processed_by: Vec<String>,
    error: Option<String>,
    handler_errors: Vec<String>,
    context: Option<EventContext>,
    finished_at: Option<DateTime<Utc>>,
}

/// An event dispatched through the bus.
///
/// Identity, type, source, payload and metadata are fixed once the event is
/// shared. Dispatch state (status, `processed_by`, errors, chain context)
/// lives behind a lock so concurrent handlers can share one `Arc<Event>`.
#[derive(Debug)]
pub struct Event {
    id: EventId,
    event_type: String,
    timestamp: DateTime<Utc>,
    source: String,
    payload: Map<String, Value>,
    metadata: HashMap<String, Value>,
    state: Mutex<DispatchState>,
}

impl Event {
    /// Create a new pending event.
    #[must_use]
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            source: source.into(),
            payload: Map::new(),
            metadata: HashMap::new(),
            state: Mutex::new(DispatchState::default()),
        }
    }

    /// Replace the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Set a single payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Set a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Tag the event with the conversation and agent it belongs to.
    ///
    /// Read by the chain-aware bus when this event starts a new chain.
    #[must_use]
    pub fn with_conversation(
        self,
        conversation_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        self.with_metadata(CONVERSATION_ID_KEY, conversation_id.into())
            .with_metadata(AGENT_ID_KEY, agent_id.into())
    }

    /// Attach a chain context before publishing.
    #[must_use]
    pub fn with_context(self, context: EventContext) -> Self {
        self.lock_state().context = Some(context);
        self
    }

    /// Create a child event in the same execution chain.
    ///
    /// The child inherits source, conversation and agent metadata and, if
    /// this event carries a context, a derived context sharing its
    /// cancellation signal.
    #[must_use]
    pub fn create_child(&self, event_type: impl Into<String>) -> Self {
        let mut child = Self::new(event_type, self.source.clone())
            .with_metadata(PARENT_EVENT_ID_KEY, self.id.to_string());
        for key in [CONVERSATION_ID_KEY, AGENT_ID_KEY] {
            if let Some(value) = self.metadata.get(key) {
                child.metadata.insert(key.to_owned(), value.clone());
            }
        }
        let context = self.lock_state().context.as_ref().map(EventContext::child);
        if let Some(context) = context {
            child = child.with_context(context);
        }
        child
    }

    /// Event id.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Dotted hierarchical event type, e.g. `tool.execution.completed`.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Creation time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Component that produced the event.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Opaque payload.
    #[must_use]
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Payload field lookup.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Event metadata.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// String metadata lookup.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> EventStatus {
        self.lock_state().status
    }

    /// Handlers that were invoked for this event, in invocation order.
    #[must_use]
    pub fn processed_by(&self) -> Vec<String> {
        self.lock_state().processed_by.clone()
    }

    /// Most recent error recorded on the event.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.lock_state().error.clone()
    }

    /// Every handler error recorded during dispatch.
    #[must_use]
    pub fn handler_errors(&self) -> Vec<String> {
        self.lock_state().handler_errors.clone()
    }

    /// Chain context, if this event is chain-aware and has been published.
    #[must_use]
    pub fn context(&self) -> Option<EventContext> {
        self.lock_state().context.clone()
    }

    /// Whether the event carries a chain context.
    #[must_use]
    pub fn has_context(&self) -> bool {
        self.lock_state().context.is_some()
    }

    /// Whether this event's chain has been asked to stop.
    ///
    /// Long-running handlers can poll this to cooperate with interruption.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.lock_state()
            .context
            .as_ref()
            .is_some_and(EventContext::is_cancelled)
    }

    /// When dispatch reached a terminal status.
    #[must_use]
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().finished_at
    }

    /// Move to `Processing`. Returns whether the transition was applied.
    pub fn mark_processing(&self) -> bool {
        self.transition(EventStatus::Processing, None)
    }

    /// Move to `Completed`. Returns whether the transition was applied.
    pub fn mark_completed(&self) -> bool {
        self.transition(EventStatus::Completed, None)
    }

    /// Move to `Failed` with a reason. Returns whether the transition was applied.
    pub fn mark_failed(&self, reason: impl Into<String>) -> bool {
        self.transition(EventStatus::Failed, Some(reason.into()))
    }

    /// Move to `Cancelled` with a reason. Returns whether the transition was applied.
    pub fn mark_cancelled(&self, reason: impl Into<String>) -> bool {
        self.transition(EventStatus::Cancelled, Some(reason.into()))
    }

    /// Record that a handler failed without deciding the final status.
    ///
    /// The dispatcher picks the terminal status once every handler has run.
    pub fn record_handler_error(&self, handler: &str, message: impl Into<String>) {
        let text = format!("{handler}: {}", message.into());
        let mut state = self.lock_state();
        state.handler_errors.push(text.clone());
        state.error = Some(text);
    }

    /// Record that a handler was invoked. Repeated invocations (retries)
    /// are recorded once.
    pub fn record_processed_by(&self, handler: &str) {
        let mut state = self.lock_state();
        if !state.processed_by.iter().any(|h| h == handler) {
            state.processed_by.push(handler.to_owned());
        }
    }

    /// Append an id to the context's execution chain. Returns the updated
    /// context, or `None` if the event has no context.
    pub(crate) fn extend_chain(&self, id: EventId) -> Option<EventContext> {
        let mut state = self.lock_state();
        let context = state.context.as_mut()?;
        if context.execution_chain.last() != Some(&id) {
            context.execution_chain.push(id);
        }
        Some(context.clone())
    }

    pub(crate) fn set_context(&self, context: EventContext) {
        self.lock_state().context = Some(context);
    }

    /// Serializable view of the event.
    #[must_use]
    pub fn snapshot(&self) -> EventSnapshot {
        let state = self.lock_state();
        EventSnapshot {
            id: self.id,
            event_type: self.event_type.clone(),
            timestamp: self.timestamp,
            source: self.source.clone(),
            status: state.status,
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            processed_by: state.processed_by.clone(),
            error: state.error.clone(),
            handler_errors: state.handler_errors.clone(),
            context: state.context.as_ref().map(EventContext::snapshot),
            finished_at: state.finished_at,
        }
    }

    fn transition(&self, next: EventStatus, reason: Option<String>) -> bool {
        let mut state = self.lock_state();
        if !state.status.can_transition_to(next) {
            debug!(
                event_id = %self.id,
                from = %state.status,
                to = %next,
                "Ignoring illegal status transition"
            );
            return false;
        }
        state.status = next;
        if let Some(reason) = reason {
            state.error = Some(reason);
        }
        if next.is_terminal() {
            state.finished_at = Some(Utc::now());
        }
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serializable point-in-time view of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSnapshot {
    /// Event id.
    pub id: EventId,
    /// Event type.
    pub event_type: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Producer.
    pub source: String,
    /// Status at snapshot time.
    pub status: EventStatus,
    /// Payload.
    pub payload: Map<String, Value>,
    /// Metadata.
    pub metadata: HashMap<String, Value>,
    /// Handlers invoked.
    pub processed_by: Vec<String>,
    /// Last error.
    pub error: Option<String>,
    /// All handler errors.
    pub handler_errors: Vec<String>,
    /// Chain context.
    pub context: Option<ContextSnapshot>,
    /// Terminal status time.
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_event_is_pending() {
        let event = Event::new("test.ping", "tests").with_field("x", 1);
        assert_eq!(event.status(), EventStatus::Pending);
        assert_eq!(event.event_type(), "test.ping");
        assert_eq!(event.field("x"), Some(&json!(1)));
        assert!(event.processed_by().is_empty());
        assert!(event.error().is_none());
        assert!(!event.has_context());
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let event = Event::new("a.b", "tests");
        assert!(!event.mark_completed());
        assert!(event.mark_processing());
        assert!(!event.mark_processing());
        assert!(event.mark_completed());
        assert!(event.finished_at().is_some());

        assert!(!event.mark_failed("late"));
        assert!(!event.mark_cancelled("late"));
        assert_eq!(event.status(), EventStatus::Completed);
        assert!(event.error().is_none());
    }

    #[test]
    fn test_cancel_from_pending_and_processing() {
        let pending = Event::new("a", "tests");
        assert!(pending.mark_cancelled("stop"));
        assert_eq!(pending.status(), EventStatus::Cancelled);
        assert_eq!(pending.error().as_deref(), Some("stop"));

        let processing = Event::new("a", "tests");
        processing.mark_processing();
        assert!(processing.mark_cancelled("stop"));
        assert!(!processing.mark_processing());
    }

    #[test]
    fn test_processed_by_dedupes_retries() {
        let event = Event::new("a", "tests");
        event.record_processed_by("h1");
        event.record_processed_by("h1");
        event.record_processed_by("h2");
        assert_eq!(event.processed_by(), vec!["h1", "h2"]);
    }

    #[test]
    fn test_handler_errors_accumulate() {
        let event = Event::new("a", "tests");
        event.record_handler_error("h1", "boom");
        event.record_handler_error("h2", "bang");
        assert_eq!(event.error().as_deref(), Some("h2: bang"));
        assert_eq!(event.handler_errors(), vec!["h1: boom", "h2: bang"]);
        assert_eq!(event.status(), EventStatus::Pending);
    }

    #[test]
    fn test_create_child_without_context() {
        let parent = Event::new("workflow.start", "agent").with_conversation("c1", "a1");
        let child = parent.create_child("workflow.step");

        assert_eq!(child.source(), "agent");
        assert_eq!(child.metadata_str(CONVERSATION_ID_KEY), Some("c1"));
        assert_eq!(child.metadata_str(AGENT_ID_KEY), Some("a1"));
        assert_eq!(
            child.metadata_str(PARENT_EVENT_ID_KEY),
            Some(parent.id().to_string().as_str())
        );
        assert!(!child.has_context());
    }

    #[test]
    fn test_create_child_shares_signal() {
        let parent = Event::new("workflow.start", "agent");
        let ctx = EventContext::root(parent.id(), "c1", "a1");
        let parent = parent.with_context(ctx);

        let child = parent.create_child("workflow.step");
        let parent_ctx = parent.context().unwrap();
        let child_ctx = child.context().unwrap();

        assert!(parent_ctx.signal().same_signal(child_ctx.signal()));
        assert_eq!(child_ctx.execution_chain, parent_ctx.execution_chain);

        parent_ctx.signal().cancel("stop");
        assert!(child.is_cancellation_requested());
    }

    #[test]
    fn test_extend_chain_is_idempotent_for_tail() {
        let root = Event::new("r", "t");
        let root_id = root.id();
        let root = root.with_context(EventContext::root(root_id, "c", "a"));
        let child = root.create_child("c");
        let child_id = child.id();

        let ctx = child.extend_chain(child_id).unwrap();
        assert_eq!(ctx.execution_chain, vec![root_id, child_id]);
        let ctx = child.extend_chain(child_id).unwrap();
        assert_eq!(ctx.execution_chain.len(), 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let event = Event::new("test.ping", "tests").with_field("x", 1);
        event.mark_processing();
        event.record_processed_by("echo");
        event.mark_completed();

        let value = serde_json::to_value(event.snapshot()).unwrap();
        assert_eq!(value["event_type"], "test.ping");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["processed_by"], json!(["echo"]));
        assert_eq!(value["payload"]["x"], 1);
    }
}
