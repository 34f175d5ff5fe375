//! Ember Events - hierarchical pub/sub event bus.
//!
//! This crate provides:
//! - An [`Event`] record with a monotonic dispatch state machine
//! - A [`HandlerRegistry`] with glob patterns and dependency ordering
//! - A [`MiddlewareChain`] around every handler invocation
//! - The [`EventBus`] dispatcher with bounded concurrency and history
//! - The [`ChainableEventBus`], which adds execution chains and cooperative
//!   cancellation
//!
//! # Architecture
//!
//! Handlers are registered by name with one or more glob patterns
//! (`tool.*`, `*.completed`). Publishing an event resolves the enabled
//! handlers whose patterns match its type: those without dependencies run
//! concurrently, then the rest run in dependency order. Each invocation goes
//! through the middleware chain, by default
//! `Logging → Metrics → ErrorIsolation → Retry`.
//!
//! # Example
//!
//! ```rust
//! use ember_events::{Event, EventBus, EventStatus, HandlerRegistration, handler_fn};
//! use std::sync::Arc;
//!
//! # async fn example() -> ember_events::EventResult<()> {
//! let bus = EventBus::new();
//! bus.subscribe(
//!     HandlerRegistration::new("echo", handler_fn(|_| Ok(true))).pattern("test.*"),
//! )?;
//!
//! let event = Arc::new(Event::new("test.ping", "docs").with_field("x", 1));
//! assert!(bus.publish(Arc::clone(&event)).await?);
//! assert_eq!(event.status(), EventStatus::Completed);
//! assert_eq!(event.processed_by(), vec!["echo"]);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod middleware;
pub mod prelude;

mod bus;
mod chain;
mod context;
mod error;
mod event;
mod forwarder;
mod handler;
mod pattern;
mod registry;

pub use bus::{
    BusConfig, BusStats, DEFAULT_MAX_CONCURRENT_HANDLERS, DEFAULT_MAX_HISTORY_SIZE, EventBus,
    NO_SUCCESS_REASON,
};
pub use chain::{ActiveChains, ChainSummary, ChainableEventBus};
pub use context::{CancellationSignal, ContextSnapshot, EventContext};
pub use error::{EventError, EventResult};
pub use event::{
    AGENT_ID_KEY, CONVERSATION_ID_KEY, Event, EventId, EventSnapshot, EventStatus,
    PARENT_EVENT_ID_KEY,
};
pub use forwarder::{BroadcastForwarder, DEFAULT_CHANNEL_CAPACITY, EventForwarder, EventReceiver};
pub use handler::{AsyncFnHandler, EventHandler, Handler, SyncFnHandler, async_handler_fn, handler_fn};
pub use middleware::{
    ErrorIsolationMiddleware, LoggingMiddleware, MetricsMiddleware, Middleware, MiddlewareChain,
    MiddlewareContext, Next, RetryConfig, RetryMiddleware,
};
pub use pattern::{EventPattern, any_matches, compile_patterns};
pub use registry::{
    HandlerInfo, HandlerRegistration, HandlerRegistry, MAX_CACHED_RESOLUTIONS, Resolution,
};
