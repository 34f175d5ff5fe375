//! Glob patterns matched against dotted event types.
//!
//! One matcher serves every subscription surface (handlers, forwarders,
//! history filters):
//! - `tool.execution.completed` - exact match
//! - `tool.*` - any type starting with `tool.` (`*` also crosses dots)
//! - `*.completed` - any type ending in `.completed`
//! - `task.?` - `task.` followed by exactly one character
//! - `*` - everything
//! - `order.[ab]` - character class, one of the listed characters
//! - `order.{created,paid}` - alternation, any of the listed branches
//!
//! `[`, `]`, `{` and `}` are glob syntax, so an event type containing them
//! literally can only be matched through a class such as `[{]`.

use globset::{Glob, GlobMatcher};

use crate::error::{EventError, EventResult};

/// A compiled event-type pattern.
#[derive(Debug, Clone)]
pub struct EventPattern {
    /// The original pattern string.
    pattern: String,
    /// Compiled glob matcher (None for exact matches).
    matcher: Option<GlobMatcher>,
}

impl EventPattern {
    /// Compile a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`] if the pattern is empty or the
    /// glob syntax is malformed (e.g. an unclosed `[`).
    pub fn new(pattern: impl Into<String>) -> EventResult<Self> {
        let pattern = pattern.into();

        if pattern.trim().is_empty() {
            return Err(EventError::InvalidPattern {
                pattern,
                reason: "pattern is empty".to_string(),
            });
        }

        let is_glob = pattern.contains(['*', '?', '[', '{']);

        let matcher = if is_glob {
            let glob = Glob::new(&pattern).map_err(|e| EventError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            Some(glob.compile_matcher())
        } else {
            None
        };

        Ok(Self { pattern, matcher })
    }

    /// Pattern matching every event type.
    #[must_use]
    pub fn any() -> Self {
        Self {
            pattern: "*".to_string(),
            matcher: Glob::new("*").ok().map(|g| g.compile_matcher()),
        }
    }

    /// Check whether an event type matches.
    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        match &self.matcher {
            Some(matcher) => matcher.is_match(event_type),
            None => self.pattern == event_type,
        }
    }

    /// The original pattern string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether this pattern contains wildcards.
    #[must_use]
    pub fn is_glob(&self) -> bool {
        self.matcher.is_some()
    }
}

impl PartialEq for EventPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for EventPattern {}

impl std::fmt::Display for EventPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

/// Compile a list of pattern strings.
///
/// # Errors
///
/// Returns the first [`EventError::InvalidPattern`] encountered.
pub fn compile_patterns<I, S>(patterns: I) -> EventResult<Vec<EventPattern>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    patterns.into_iter().map(EventPattern::new).collect()
}

/// Whether any pattern in the set matches.
#[must_use]
pub fn any_matches(patterns: &[EventPattern], event_type: &str) -> bool {
    patterns.iter().any(|p| p.matches(event_type))
}
