//! Handler registry with dependency-ordered resolution.
//!
//! Handlers are registered by name with a set of glob patterns and optional
//! dependencies on other handlers. [`HandlerRegistry::resolve`] splits the
//! enabled handlers matching an event type into an unordered independent set
//! and a dependency-ordered dependent set. Resolutions are cached per event
//! type and dropped on every mutation.
//!
//! Misconfiguration (duplicate names, unknown dependencies, cycles) is logged
//! and tolerated, never returned as an error.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::EventResult;
use crate::handler::Handler;
use crate::pattern::{EventPattern, any_matches, compile_patterns};

/// Upper bound on cached resolutions. Event types built from dynamic ids
/// would otherwise grow the cache without limit; past this many distinct
/// types the cache is dropped and refilled.
pub const MAX_CACHED_RESOLUTIONS: usize = 1024;

/// Builder describing a handler to register.
pub struct HandlerRegistration {
    name: String,
    handler: Handler,
    patterns: Vec<String>,
    depends_on: Vec<String>,
    retry_count: u32,
    retry_delay: Duration,
    enabled: bool,
}

impl HandlerRegistration {
    /// Start a registration for `handler` under `name`.
    pub fn new(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            handler,
            patterns: Vec::new(),
            depends_on: Vec::new(),
            retry_count: 0,
            retry_delay: Duration::ZERO,
            enabled: true,
        }
    }

    /// Add a glob pattern matched against event types.
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Add several glob patterns.
    #[must_use]
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Declare that this handler must run after `handler_name`.
    #[must_use]
    pub fn depends_on(mut self, handler_name: impl Into<String>) -> Self {
        let dep = handler_name.into();
        if !self.depends_on.contains(&dep) {
            self.depends_on.push(dep);
        }
        self
    }

    /// Per-handler retry policy. A count of 0 defers to the retry middleware.
    #[must_use]
    pub fn retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    /// Register the handler in the disabled state.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .field("depends_on", &self.depends_on)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// A registered handler.
#[derive(Clone)]
pub struct HandlerInfo {
    /// Unique handler name.
    pub name: String,
    /// Patterns matched against event types.
    pub patterns: Vec<EventPattern>,
    /// Names of handlers that must run first.
    pub depends_on: Vec<String>,
    /// Retry attempts for this handler (0 = middleware default).
    pub retry_count: u32,
    /// Base retry delay for this handler.
    pub retry_delay: Duration,
    /// Whether the handler takes part in resolution.
    pub enabled: bool,
    /// When the handler was (last) registered.
    pub registered_at: DateTime<Utc>,
    handler: Handler,
}

impl HandlerInfo {
    /// The handler implementation.
    #[must_use]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Whether any pattern matches `event_type`.
    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        any_matches(&self.patterns, event_type)
    }

    /// Whether this handler declares dependencies.
    #[must_use]
    pub fn has_dependencies(&self) -> bool {
        !self.depends_on.is_empty()
    }

    /// The per-handler retry policy, if one was declared.
    #[must_use]
    pub fn retry_policy(&self) -> Option<(u32, Duration)> {
        (self.retry_count > 0).then_some((self.retry_count, self.retry_delay))
    }
}

impl std::fmt::Debug for HandlerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerInfo")
            .field("name", &self.name)
            .field(
                "patterns",
                &self.patterns.iter().map(EventPattern::as_str).collect::<Vec<_>>(),
            )
            .field("depends_on", &self.depends_on)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Handlers matching one event type.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Handlers without dependencies; no relative order.
    pub independent: Vec<Arc<HandlerInfo>>,
    /// Handlers with dependencies, in topological order.
    pub dependent: Vec<Arc<HandlerInfo>>,
}

impl Resolution {
    /// Whether no handler matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.independent.is_empty() && self.dependent.is_empty()
    }

    /// Total number of matched handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.independent.len().saturating_add(self.dependent.len())
    }

    /// Matched handler names, independent first.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.independent
            .iter()
            .chain(&self.dependent)
            .map(|h| h.name.as_str())
            .collect()
    }
}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Arc<HandlerInfo>>,
    /// Registration order, used to keep resolution deterministic.
    order: Vec<String>,
    cache: HashMap<String, Arc<Resolution>>,
    generation: u64,
}

impl RegistryState {
    fn invalidate(&mut self) {
        self.cache.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<HandlerInfo>> {
        self.order.iter().filter_map(|name| self.handlers.get(name))
    }

    fn compute(&self, event_type: &str) -> Resolution {
        let matched: Vec<Arc<HandlerInfo>> = self
            .ordered()
            .filter(|h| h.enabled && h.matches(event_type))
            .cloned()
            .collect();

        let independent = matched
            .iter()
            .filter(|h| !h.has_dependencies())
            .cloned()
            .collect();
        let dependent = topological_order(&matched, event_type);

        Resolution {
            independent,
            dependent,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first topological sort of the dependent handlers in `matched`.
///
/// Dependencies outside the matched set are ignored. A back-edge is logged
/// and skipped, so cycles never fail resolution.
fn topological_order(matched: &[Arc<HandlerInfo>], event_type: &str) -> Vec<Arc<HandlerInfo>> {
    fn visit<'a>(
        info: &'a Arc<HandlerInfo>,
        by_name: &HashMap<&'a str, &'a Arc<HandlerInfo>>,
        marks: &mut HashMap<&'a str, Mark>,
        ordered: &mut Vec<Arc<HandlerInfo>>,
        event_type: &str,
    ) {
        marks.insert(info.name.as_str(), Mark::Visiting);
        for dep in &info.depends_on {
            let Some(&dep_info) = by_name.get(dep.as_str()) else {
                continue;
            };
            match marks.get(dep.as_str()) {
                Some(Mark::Visiting) => {
                    warn!(
                        handler = %info.name,
                        dependency = %dep,
                        event_type = %event_type,
                        "Dependency cycle detected, skipping back-edge"
                    );
                },
                Some(Mark::Done) => {},
                None => visit(dep_info, by_name, marks, ordered, event_type),
            }
        }
        marks.insert(info.name.as_str(), Mark::Done);
        if info.has_dependencies() {
            ordered.push(Arc::clone(info));
        }
    }

    let by_name: HashMap<&str, &Arc<HandlerInfo>> =
        matched.iter().map(|h| (h.name.as_str(), h)).collect();
    let mut marks = HashMap::new();
    let mut ordered = Vec::new();

    for info in matched.iter().filter(|h| h.has_dependencies()) {
        if !marks.contains_key(info.name.as_str()) {
            visit(info, &by_name, &mut marks, &mut ordered, event_type);
        }
    }

    ordered
}

/// Registry of handlers keyed by name.
#[derive(Default)]
pub struct HandlerRegistry {
    state: RwLock<RegistryState>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any existing handler with the same name.
    ///
    /// Unknown dependencies and name collisions are logged, not rejected.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`] if a pattern fails to compile;
    /// the registry is left unchanged.
    pub fn register(&self, registration: HandlerRegistration) -> EventResult<()> {
        let HandlerRegistration {
            name,
            handler,
            patterns,
            mut depends_on,
            retry_count,
            retry_delay,
            enabled,
        } = registration;

        let patterns = compile_patterns(patterns)?;
        if patterns.is_empty() {
            warn!(handler = %name, "Handler registered without patterns; it will never match");
        }

        if depends_on.iter().any(|d| *d == name) {
            warn!(handler = %name, "Handler depends on itself; ignoring self-dependency");
            depends_on.retain(|d| *d != name);
        }

        let info = HandlerInfo {
            name: name.clone(),
            patterns,
            depends_on,
            retry_count,
            retry_delay,
            enabled,
            registered_at: Utc::now(),
            handler,
        };

        let mut state = self.write();
        for dep in &info.depends_on {
            if !state.handlers.contains_key(dep) {
                warn!(
                    handler = %name,
                    dependency = %dep,
                    "Handler depends on a handler that is not registered (yet)"
                );
            }
        }

        if state.handlers.insert(name.clone(), Arc::new(info)).is_some() {
            warn!(handler = %name, "Handler already registered; overwriting");
        } else {
            state.order.push(name.clone());
        }
        state.invalidate();

        info!(handler = %name, enabled, "Registered handler");
        Ok(())
    }

    /// Remove a handler and strip it from every other handler's dependencies.
    ///
    /// Returns whether a handler was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut state = self.write();
        if state.handlers.remove(name).is_none() {
            debug!(handler = %name, "Unregister requested for unknown handler");
            return false;
        }
        state.order.retain(|n| n != name);

        for info in state.handlers.values_mut() {
            if info.depends_on.iter().any(|d| d == name) {
                let mut updated = HandlerInfo::clone(&**info);
                updated.depends_on.retain(|d| d != name);
                *info = Arc::new(updated);
            }
        }
        state.invalidate();

        info!(handler = %name, "Unregistered handler");
        true
    }

    /// Enable a handler. Returns whether the handler exists.
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Disable a handler without removing it. Returns whether the handler exists.
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut state = self.write();
        let Some(info) = state.handlers.get_mut(name) else {
            warn!(handler = %name, enabled, "Cannot toggle unknown handler");
            return false;
        };
        if info.enabled != enabled {
            let mut updated = HandlerInfo::clone(&**info);
            updated.enabled = enabled;
            *info = Arc::new(updated);
        }
        state.invalidate();
        debug!(handler = %name, enabled, "Toggled handler");
        true
    }

    /// Resolve the enabled handlers matching `event_type`.
    ///
    /// Cached until the next registry mutation, for at most
    /// [`MAX_CACHED_RESOLUTIONS`] distinct event types.
    pub fn resolve(&self, event_type: &str) -> Arc<Resolution> {
        let (resolution, generation) = {
            let state = self.read();
            if let Some(hit) = state.cache.get(event_type) {
                return Arc::clone(hit);
            }
            (Arc::new(state.compute(event_type)), state.generation)
        };

        let mut state = self.write();
        // A mutation between the read and write locks makes this result stale.
        if state.generation == generation {
            if state.cache.len() >= MAX_CACHED_RESOLUTIONS {
                debug!(
                    cached = state.cache.len(),
                    "Resolution cache full, clearing"
                );
                state.cache.clear();
            }
            state
                .cache
                .insert(event_type.to_owned(), Arc::clone(&resolution));
        }
        resolution
    }

    /// Look up a handler by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<HandlerInfo>> {
        self.read().handlers.get(name).cloned()
    }

    /// Whether a handler with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read().handlers.contains_key(name)
    }

    /// All handlers in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<HandlerInfo>> {
        self.read().ordered().cloned().collect()
    }

    /// Handler name → declared dependencies.
    #[must_use]
    pub fn dependency_graph(&self) -> HashMap<String, Vec<String>> {
        self.read()
            .handlers
            .iter()
            .map(|(name, info)| (name.clone(), info.depends_on.clone()))
            .collect()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().handlers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().handlers.is_empty()
    }

    /// Number of enabled handlers.
    #[must_use]
    pub fn enabled_count(&self) -> usize {
        self.read().handlers.values().filter(|h| h.enabled).count()
    }

    /// Number of cached resolutions.
    #[must_use]
    pub fn cached_resolutions(&self) -> usize {
        self.read().cache.len()
    }

    /// Remove every handler.
    pub fn clear(&self) {
        let mut state = self.write();
        state.handlers.clear();
        state.order.clear();
        state.invalidate();
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &state.order)
            .field("cached_resolutions", &state.cache.len())
            .finish()
    }
}
