//! Chain-aware dispatcher with cooperative cancellation.
//!
//! [`ChainableEventBus`] wraps an [`EventBus`]. An event published without a
//! context becomes the root of a new execution chain and receives a fresh
//! [`CancellationSignal`]. Children created with [`Event::create_child`] share
//! that signal, so interrupting the conversation or the root stops every
//! event in the chain at its next poll. Polls happen once before dispatch and
//! again before each handler; a handler that is already running finishes.
//!
//! Chain records outlive their events so late interrupts still land. Call
//! [`ChainableEventBus::end_event_chain`] once a workflow is done to release
//! them.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::context::{CancellationSignal, EventContext};
use crate::error::EventResult;
use crate::event::{AGENT_ID_KEY, CONVERSATION_ID_KEY, Event, EventId, EventStatus};
use crate::registry::HandlerRegistration;

#[derive(Debug)]
struct ChainRecord {
    context: EventContext,
    members: Vec<EventId>,
}

impl ChainRecord {
    fn admit(&mut self, id: EventId) {
        if !self.members.contains(&id) {
            self.members.push(id);
        }
    }
}

#[derive(Debug, Default)]
struct ChainState {
    chains: HashMap<EventId, ChainRecord>,
    conversations: HashMap<String, EventId>,
}

/// One tracked execution chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSummary {
    /// Root event id.
    pub root_event_id: EventId,
    /// Conversation id.
    pub conversation_id: String,
    /// Agent id.
    pub agent_id: String,
    /// Member events in publish order, root first.
    pub event_ids: Vec<EventId>,
    /// Number of member events.
    pub event_count: usize,
    /// Whether the chain has been interrupted.
    pub cancelled: bool,
}

/// Snapshot of all tracked chains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveChains {
    /// Chains, ordered by conversation id then root id.
    pub chains: Vec<ChainSummary>,
    /// Number of chains.
    pub total_chains: usize,
    /// Member events across all chains.
    pub total_events: usize,
}

/// Event bus that tracks execution chains and supports interruption.
#[derive(Debug)]
pub struct ChainableEventBus {
    bus: EventBus,
    state: RwLock<ChainState>,
}

impl ChainableEventBus {
    /// Wrap a dispatcher.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            state: RwLock::new(ChainState::default()),
        }
    }

    /// The wrapped dispatcher.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register a handler on the wrapped dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`](crate::EventError::InvalidPattern)
    /// for a malformed pattern.
    pub fn subscribe(&self, registration: HandlerRegistration) -> EventResult<()> {
        self.bus.subscribe(registration)
    }

    /// Remove a handler. Returns whether it existed.
    pub fn unsubscribe(&self, name: &str) -> bool {
        self.bus.unsubscribe(name)
    }

    /// Publish an event, tracking it in its execution chain.
    ///
    /// An event without a context starts a new chain. Its conversation and
    /// agent ids come from the `conversation_id` and `agent_id` metadata,
    /// falling back to the configured defaults. An event that already carries
    /// a context joins the chain of its root.
    ///
    /// # Errors
    ///
    /// As for [`EventBus::publish`].
    pub async fn publish(&self, event: impl Into<Arc<Event>>) -> EventResult<bool> {
        let event = event.into();
        if event.status() != EventStatus::Pending {
            // Rejected by the dispatcher; keep it out of the chain records.
            return self.bus.dispatch(event, None).await;
        }

        let context = match event.extend_chain(event.id()) {
            Some(context) => self.join_chain(&event, context),
            None => self.start_chain(&event),
        };

        self.bus
            .dispatch(event, Some(context.signal().clone()))
            .await
    }

    fn start_chain(&self, event: &Event) -> EventContext {
        let config = self.bus.config();
        let conversation_id = event
            .metadata_str(CONVERSATION_ID_KEY)
            .unwrap_or(&config.default_conversation_id)
            .to_owned();
        let agent_id = event
            .metadata_str(AGENT_ID_KEY)
            .unwrap_or(&config.default_agent_id)
            .to_owned();

        let context = EventContext::root(event.id(), conversation_id, agent_id);
        event.set_context(context.clone());
        self.track_root(event.id(), &context);
        context
    }

    fn join_chain(&self, event: &Event, context: EventContext) -> EventContext {
        let root_id = context.root_event_id;
        if root_id == event.id() {
            // Root published with a hand-built context.
            self.track_root(root_id, &context);
            return context;
        }

        let mut state = self.lock_state_mut();
        let record = state.chains.entry(root_id).or_insert_with(|| {
            debug!(
                root_event_id = %root_id,
                event_id = %event.id(),
                "Recreating record for ended chain"
            );
            ChainRecord {
                context: context.clone(),
                members: Vec::new(),
            }
        });
        record.admit(event.id());
        debug!(
            root_event_id = %root_id,
            event_id = %event.id(),
            depth = context.depth(),
            "Event joined chain"
        );
        context
    }

    fn track_root(&self, root_id: EventId, context: &EventContext) {
        let mut state = self.lock_state_mut();
        if let Some(previous) = state
            .conversations
            .insert(context.conversation_id.clone(), root_id)
            .filter(|previous| *previous != root_id)
        {
            debug!(
                conversation_id = %context.conversation_id,
                previous_root = %previous,
                root_event_id = %root_id,
                "Conversation now indexed by a newer root"
            );
        }
        state
            .chains
            .entry(root_id)
            .or_insert_with(|| ChainRecord {
                context: context.clone(),
                members: Vec::new(),
            })
            .admit(root_id);
        debug!(
            root_event_id = %root_id,
            conversation_id = %context.conversation_id,
            agent_id = %context.agent_id,
            "Chain started"
        );
    }

    /// Interrupt the chain currently indexed for a conversation.
    ///
    /// Returns whether a chain was found. Events already past their last poll
    /// are unaffected.
    pub fn interrupt_conversation(&self, conversation_id: &str, reason: &str) -> bool {
        let signal = {
            let state = self.lock_state();
            state
                .conversations
                .get(conversation_id)
                .and_then(|root| state.chains.get(root))
                .map(|record| record.context.signal().clone())
        };

        match signal {
            Some(signal) => {
                signal.cancel(reason);
                info!(conversation_id, reason, "Conversation interrupted");
                true
            },
            None => {
                warn!(conversation_id, "No active chain for conversation");
                false
            },
        }
    }

    /// Interrupt a chain by its root event id. Returns whether it was found.
    pub fn interrupt_event_chain(&self, root_event_id: EventId, reason: &str) -> bool {
        let signal = self
            .lock_state()
            .chains
            .get(&root_event_id)
            .map(|record| record.context.signal().clone());

        match signal {
            Some(signal) => {
                signal.cancel(reason);
                info!(root_event_id = %root_event_id, reason, "Event chain interrupted");
                true
            },
            None => {
                warn!(root_event_id = %root_event_id, "No such event chain");
                false
            },
        }
    }

    /// Release the tracking state of a chain. Returns whether it existed.
    ///
    /// The chain's signal is left as it is; events still holding it keep
    /// observing it.
    pub fn end_event_chain(&self, root_event_id: EventId, reason: &str) -> bool {
        let mut state = self.lock_state_mut();
        let Some(record) = state.chains.remove(&root_event_id) else {
            debug!(root_event_id = %root_event_id, "Chain already ended");
            return false;
        };

        let conversation_id = &record.context.conversation_id;
        if state.conversations.get(conversation_id) == Some(&root_event_id) {
            state.conversations.remove(conversation_id);
        }
        info!(
            root_event_id = %root_event_id,
            conversation_id = %conversation_id,
            events = record.members.len(),
            reason,
            "Event chain ended"
        );
        true
    }

    /// The signal for a conversation's current chain.
    #[must_use]
    pub fn conversation_signal(&self, conversation_id: &str) -> Option<CancellationSignal> {
        let state = self.lock_state();
        state
            .conversations
            .get(conversation_id)
            .and_then(|root| state.chains.get(root))
            .map(|record| record.context.signal().clone())
    }

    /// Summary of one chain.
    #[must_use]
    pub fn chain(&self, root_event_id: EventId) -> Option<ChainSummary> {
        self.lock_state()
            .chains
            .get(&root_event_id)
            .map(|record| summarize(root_event_id, record))
    }

    /// Read-only snapshot of every tracked chain.
    #[must_use]
    pub fn get_active_chains(&self) -> ActiveChains {
        let state = self.lock_state();
        let mut chains: Vec<ChainSummary> = state
            .chains
            .iter()
            .map(|(root, record)| summarize(*root, record))
            .collect();
        drop(state);

        chains.sort_by(|a, b| {
            a.conversation_id
                .cmp(&b.conversation_id)
                .then(a.root_event_id.cmp(&b.root_event_id))
        });
        let total_events = chains.iter().map(|c| c.event_count).sum();
        ActiveChains {
            total_chains: chains.len(),
            total_events,
            chains,
        }
    }

    fn lock_state(&self) -> std::sync::RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state_mut(&self) -> std::sync::RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ChainableEventBus {
    fn default() -> Self {
        Self::new(EventBus::new())
    }
}

fn summarize(root_event_id: EventId, record: &ChainRecord) -> ChainSummary {
    ChainSummary {
        root_event_id,
        conversation_id: record.context.conversation_id.clone(),
        agent_id: record.context.agent_id.clone(),
        event_ids: record.members.clone(),
        event_count: record.members.len(),
        cancelled: record.context.is_cancelled(),
    }
}
