//! Transport forwarders.
//!
//! After a publish concludes, the bus offers the event to every registered
//! [`EventForwarder`] whose predicate accepts it. Each event is offered once,
//! no matter how many handlers ran.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::EventResult;
use crate::event::Event;
use crate::pattern::{EventPattern, any_matches, compile_patterns};

/// Default channel capacity for [`BroadcastForwarder`].
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Delivers concluded events to something outside the bus.
#[async_trait]
pub trait EventForwarder: Send + Sync {
    /// Unique forwarder name.
    fn name(&self) -> &str;

    /// Whether this event should be forwarded.
    fn should_forward(&self, event: &Event) -> bool;

    /// Forward one concluded event.
    ///
    /// # Errors
    ///
    /// Transport failures; the bus logs them and carries on.
    async fn forward(&self, event: Arc<Event>) -> EventResult<()>;
}

/// Forwards matching events onto a tokio broadcast channel.
///
/// Receivers that fall behind skip the events they missed and keep going.
#[derive(Debug)]
pub struct BroadcastForwarder {
    name: String,
    patterns: Vec<EventPattern>,
    sender: broadcast::Sender<Arc<Event>>,
    capacity: usize,
}

impl BroadcastForwarder {
    /// Create a forwarder for the given type patterns.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`](crate::EventError::InvalidPattern)
    /// for a malformed pattern.
    pub fn new<I, S>(name: impl Into<String>, patterns: I) -> EventResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_capacity(name, patterns, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a forwarder with a specific channel capacity.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`](crate::EventError::InvalidPattern)
    /// for a malformed pattern.
    pub fn with_capacity<I, S>(
        name: impl Into<String>,
        patterns: I,
        capacity: usize,
    ) -> EventResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Ok(Self {
            name: name.into(),
            patterns: compile_patterns(patterns)?,
            sender,
            capacity,
        })
    }

    /// Receive every forwarded event.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.sender.subscribe(), None)
    }

    /// Receive only forwarded events whose type matches `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`](crate::EventError::InvalidPattern)
    /// for a malformed pattern.
    pub fn subscribe_filtered(&self, pattern: impl Into<String>) -> EventResult<EventReceiver> {
        let pattern = EventPattern::new(pattern)?;
        Ok(EventReceiver::new(self.sender.subscribe(), Some(pattern)))
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Channel capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl EventForwarder for BroadcastForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    fn should_forward(&self, event: &Event) -> bool {
        any_matches(&self.patterns, event.event_type())
    }

    async fn forward(&self, event: Arc<Event>) -> EventResult<()> {
        let event_type = event.event_type().to_owned();
        if let Ok(count) = self.sender.send(event) {
            debug!(
                forwarder = %self.name,
                event_type = %event_type,
                receiver_count = count,
                "Event forwarded"
            );
        } else {
            // No receivers - this is fine
            trace!(forwarder = %self.name, event_type = %event_type, "No receivers for event");
        }
        Ok(())
    }
}

/// Receiving end of a [`BroadcastForwarder`].
pub struct EventReceiver {
    receiver: broadcast::Receiver<Arc<Event>>,
    filter: Option<EventPattern>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<Arc<Event>>, filter: Option<EventPattern>) -> Self {
        Self { receiver, filter }
    }

    fn matches(&self, event: &Event) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|p| p.matches(event.event_type()))
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the forwarder is dropped.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        let mut skipped: usize = 0;
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                    skipped = skipped.wrapping_add(1);
                    if skipped.is_multiple_of(100) {
                        tokio::task::yield_now().await;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive the next event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                },
                Err(broadcast::error::TryRecvError::Lagged(count)) => {
                    warn!(skipped = count, "Event receiver lagged, events dropped");
                },
                Err(
                    broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
                ) => return None,
            }
        }
    }
}

impl std::fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReceiver")
            .field("filter", &self.filter.as_ref().map(EventPattern::as_str))
            .finish_non_exhaustive()
    }
}
