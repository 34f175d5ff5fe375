//! Chain context shared by every event descended from one root event.
//!
//! An [`EventContext`] links an event to its conversation and to the root of
//! its execution chain. The [`CancellationSignal`] inside it is shared by
//! reference: cloning a context (or deriving a child from it) never creates a
//! new signal, so one cancel call is observed by the whole tree of events.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::event::EventId;

/// A set-once cancellation flag shared across an execution chain.
///
/// Clones observe the same flag. Polling is cheap and lock-free; callers that
/// prefer to wait can await [`CancellationSignal::cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl CancellationSignal {
    /// Create a fresh, unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. The first reason recorded is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    /// Whether the signal has been set.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason given to the first [`cancel`](Self::cancel) call.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Wait until the signal is set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Whether two handles refer to the same underlying signal.
    #[must_use]
    pub fn same_signal(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.reason, &other.reason)
    }
}

/// Conversation and chain linkage carried by chain-aware events.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Id of the event that started this chain.
    pub root_event_id: EventId,
    /// Conversation the chain belongs to.
    pub conversation_id: String,
    /// Agent that owns the conversation.
    pub agent_id: String,
    /// Event ids from the root to the current event, inclusive.
    pub execution_chain: Vec<EventId>,
    /// Free-form context metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    signal: CancellationSignal,
}

impl EventContext {
    /// Create the context for a root event with a fresh cancellation signal.
    #[must_use]
    pub fn root(
        root_event_id: EventId,
        conversation_id: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            root_event_id,
            conversation_id: conversation_id.into(),
            agent_id: agent_id.into(),
            execution_chain: vec![root_event_id],
            metadata: HashMap::new(),
            signal: CancellationSignal::new(),
        }
    }

    /// Derive the context for a child event.
    ///
    /// Identity fields and the chain so far are copied; the cancellation
    /// signal is shared. The child's own id is appended when it is published.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            root_event_id: self.root_event_id,
            conversation_id: self.conversation_id.clone(),
            agent_id: self.agent_id.clone(),
            execution_chain: self.execution_chain.clone(),
            metadata: self.metadata.clone(),
            signal: self.signal.clone(),
        }
    }

    /// The cancellation signal shared by this chain.
    #[must_use]
    pub fn signal(&self) -> &CancellationSignal {
        &self.signal
    }

    /// Whether cancellation has been requested for this chain.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Number of events in the chain up to and including this one.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.execution_chain.len()
    }

    /// Serializable view of this context.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            root_event_id: self.root_event_id,
            conversation_id: self.conversation_id.clone(),
            agent_id: self.agent_id.clone(),
            execution_chain: self.execution_chain.clone(),
            cancelled: self.signal.is_cancelled(),
            cancel_reason: self.signal.reason().map(str::to_owned),
        }
    }
}

/// Point-in-time view of an [`EventContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Root event id.
    pub root_event_id: EventId,
    /// Conversation id.
    pub conversation_id: String,
    /// Agent id.
    pub agent_id: String,
    /// Root-to-current event ids.
    pub execution_chain: Vec<EventId>,
    /// Whether the chain had been cancelled.
    pub cancelled: bool,
    /// Cancellation reason, if any.
    pub cancel_reason: Option<String>,
}
