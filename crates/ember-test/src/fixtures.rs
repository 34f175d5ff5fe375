//! Test fixtures for common types.

use ember_events::{Event, Handler, HandlerRegistration};

/// Source recorded on every fixture event.
pub const TEST_SOURCE: &str = "test";

/// Create an event of `event_type` from [`TEST_SOURCE`].
#[must_use]
pub fn test_event(event_type: &str) -> Event {
    Event::new(event_type, TEST_SOURCE)
}

/// Create an event carrying conversation and agent metadata.
#[must_use]
pub fn test_conversation_event(event_type: &str, conversation_id: &str, agent_id: &str) -> Event {
    test_event(event_type).with_conversation(conversation_id, agent_id)
}

/// Create a child of `parent` with a marker payload field.
#[must_use]
pub fn test_child_event(parent: &Event, event_type: &str) -> Event {
    parent
        .create_child(event_type)
        .with_field("parent_type", parent.event_type())
}

/// Register `handler` under `name` for a single pattern.
#[must_use]
pub fn test_registration(name: &str, pattern: &str, handler: Handler) -> HandlerRegistration {
    HandlerRegistration::new(name, handler).pattern(pattern)
}
