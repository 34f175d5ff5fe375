//! Prelude module - commonly used test utilities.
//!
//! Use `use ember_test::prelude::*;` to import all essential helpers.

// Handler doubles
pub use crate::{CallLog, FailingHandler, FlakyHandler, RecordingHandler, SlowHandler};

// Middleware and forwarder doubles
pub use crate::{ProbeMiddleware, RecordingForwarder};

// Fixtures
pub use crate::{test_child_event, test_conversation_event, test_event, test_registration};

// Harness
pub use crate::{init_test_logging, init_test_logging_with};
