//! Configuration types for the Ember event bus.
//!
//! These types have no dependency on `ember-events`. The binary converts
//! them into the bus's own runtime types at startup. Every struct implements
//! [`Default`] with the same values as the embedded `defaults.toml`, so a
//! bare `[section]` header produces a working configuration.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dispatcher limits and chain defaults.
    pub bus: BusSection,
    /// Which standard middlewares to install.
    pub middleware: MiddlewareSection,
    /// Retry defaults for handler errors.
    pub retry: RetrySection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// BusSection
// ---------------------------------------------------------------------------

/// Dispatcher limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSection {
    /// Bound on concurrent handler invocations across the bus.
    pub max_concurrent_handlers: usize,
    /// Number of concluded events kept in history.
    pub max_history_size: usize,
    /// Conversation id assigned to root events that carry none.
    pub default_conversation_id: String,
    /// Agent id assigned to root events that carry none.
    pub default_agent_id: String,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 10,
            max_history_size: 1000,
            default_conversation_id: "default".to_owned(),
            default_agent_id: "unknown".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// MiddlewareSection
// ---------------------------------------------------------------------------

/// Standard chain membership. The order of installed middlewares is fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct MiddlewareSection {
    /// Install the logging middleware.
    pub logging: bool,
    /// Install the metrics middleware.
    pub metrics: bool,
    /// Install the error isolation middleware. Without it, handler errors
    /// escape `publish()`.
    pub error_isolation: bool,
    /// Install the retry middleware.
    pub retry: bool,
}

impl Default for MiddlewareSection {
    fn default() -> Self {
        Self {
            logging: true,
            metrics: true,
            error_isolation: true,
            retry: true,
        }
    }
}

// ---------------------------------------------------------------------------
// RetrySection
// ---------------------------------------------------------------------------

/// Retry behaviour for handler errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Total attempts, including the first.
    pub max_retries: u32,
    /// Delay after the first failed attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier applied per further attempt.
    pub backoff_factor: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"`, `"compact"`, `"json"`, or `"full"`.
    pub format: String,
    /// Per-crate tracing directives (e.g. `["ember_events=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "pretty".to_owned(),
            directives: Vec::new(),
        }
    }
}
