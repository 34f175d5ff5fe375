//! Ember Test - Shared test utilities for the Ember event bus.
//!
//! This crate provides handler, middleware and forwarder doubles plus event
//! fixtures, for use across Ember crates as a dev-dependency.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ember_events::{EventBus, HandlerRegistration};
//! use ember_test::{FlakyHandler, test_event};
//!
//! #[tokio::test]
//! async fn retries_until_success() {
//!     let bus = EventBus::new();
//!     let flaky = FlakyHandler::new(2);
//!     bus.subscribe(HandlerRegistration::new("flaky", flaky.handler()).pattern("*"))
//!         .unwrap();
//!
//!     assert!(bus.publish(test_event("job.run")).await.unwrap());
//!     assert_eq!(flaky.calls(), 3);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use fixtures::*;
pub use harness::*;
pub use mocks::*;
