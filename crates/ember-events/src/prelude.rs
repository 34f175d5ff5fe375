//! Prelude module - commonly used types for convenient import.
//!
//! Use `use ember_events::prelude::*;` to import all essential types.
//!
//! # Example
//!
//! ```rust
//! use ember_events::prelude::*;
//!
//! # async fn example() -> EventResult<()> {
//! let bus = ChainableEventBus::default();
//! bus.subscribe(HandlerRegistration::new("step", handler_fn(|_| Ok(true))).pattern("flow.*"))?;
//!
//! let root = std::sync::Arc::new(Event::new("flow.start", "docs").with_conversation("c1", "a1"));
//! bus.publish(std::sync::Arc::clone(&root)).await?;
//!
//! assert!(bus.interrupt_conversation("c1", "user stop"));
//! let child = root.create_child("flow.step");
//! assert!(!bus.publish(child).await?);
//! # Ok(())
//! # }
//! ```

// Dispatchers
pub use crate::{BusConfig, BusStats, ChainableEventBus, EventBus};

// Events & chains
pub use crate::{CancellationSignal, Event, EventContext, EventId, EventStatus};

// Handlers & registry
pub use crate::{
    EventHandler, Handler, HandlerRegistration, HandlerRegistry, async_handler_fn, handler_fn,
};

// Middleware
pub use crate::{Middleware, MiddlewareChain, MiddlewareContext, Next, RetryConfig};

// Forwarding
pub use crate::{BroadcastForwarder, EventForwarder};

// Errors
pub use crate::{EventError, EventResult};
