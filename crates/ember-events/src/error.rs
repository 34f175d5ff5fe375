//! Event bus error types.

use thiserror::Error;

/// Errors produced by handlers, the registry, and the dispatcher.
///
/// A handler returning `Err` is the bus's notion of a raised exception: it is
/// what the retry middleware retries and what error isolation swallows. A
/// handler returning `Ok(false)` is a deliberate negative outcome, not an
/// error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    /// A handler reported a failure.
    #[error("handler error: {0}")]
    Handler(String),

    /// A handler panicked while processing an event.
    #[error("handler '{handler}' panicked: {message}")]
    HandlerPanicked {
        /// Name of the handler that panicked.
        handler: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// A handler pattern could not be compiled.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern as supplied.
        pattern: String,
        /// Why compilation failed.
        reason: String,
    },

    /// A handler lookup by name failed.
    #[error("handler not found: {0}")]
    HandlerNotFound(String),

    /// A forwarder failed to deliver an event.
    #[error("forwarder '{forwarder}' failed: {reason}")]
    ForwardFailed {
        /// Name of the forwarder.
        forwarder: String,
        /// Failure description.
        reason: String,
    },

    /// The dispatcher hit an unexpected internal fault.
    #[error("internal bus error: {0}")]
    Internal(String),
}

impl EventError {
    /// Convenience constructor for handler failures.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// Result type for event bus operations.
pub type EventResult<T> = Result<T, EventError>;
