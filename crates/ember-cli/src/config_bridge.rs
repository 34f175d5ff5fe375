//! Bridge from `ember_config::Config` to runtime types.
//!
//! The config crate has no dependency on the bus. Conversion into
//! [`BusConfig`], the middleware chain and [`LogConfig`] happens here, once,
//! at startup.

use std::sync::Arc;
use std::time::Duration;

use ember_config::Config;
use ember_events::{
    BusConfig, ErrorIsolationMiddleware, EventBus, LoggingMiddleware, MetricsMiddleware,
    Middleware, MiddlewareChain, RetryConfig, RetryMiddleware,
};
use ember_telemetry::{LogConfig, TelemetryResult};

/// Convert the `[retry]` section to a [`RetryConfig`].
#[must_use]
pub fn to_retry_config(cfg: &Config) -> RetryConfig {
    RetryConfig::new(
        cfg.retry.max_retries,
        Duration::from_millis(cfg.retry.base_delay_ms),
        cfg.retry.backoff_factor,
    )
    .with_max_delay(Duration::from_millis(cfg.retry.max_delay_ms))
}

/// Convert config to [`BusConfig`].
#[must_use]
pub fn to_bus_config(cfg: &Config) -> BusConfig {
    BusConfig {
        max_concurrent_handlers: cfg.bus.max_concurrent_handlers,
        max_history_size: cfg.bus.max_history_size,
        retry: to_retry_config(cfg),
        default_conversation_id: cfg.bus.default_conversation_id.clone(),
        default_agent_id: cfg.bus.default_agent_id.clone(),
    }
}

/// Build the middleware chain selected by `[middleware]`.
///
/// Order is always `logging → metrics → error_isolation → retry`; disabled
/// members are left out. Returns the metrics middleware when installed.
#[must_use]
pub fn to_middleware_chain(cfg: &Config) -> (MiddlewareChain, Option<Arc<MetricsMiddleware>>) {
    let mut chain = MiddlewareChain::new();
    let mut metrics = None;

    if cfg.middleware.logging {
        chain.add(Arc::new(LoggingMiddleware::new()));
    }
    if cfg.middleware.metrics {
        let m = Arc::new(MetricsMiddleware::new());
        chain.add(Arc::clone(&m) as Arc<dyn Middleware>);
        metrics = Some(m);
    }
    if cfg.middleware.error_isolation {
        chain.add(Arc::new(ErrorIsolationMiddleware::new()));
    }
    if cfg.middleware.retry {
        chain.add(Arc::new(RetryMiddleware::new(to_retry_config(cfg))));
    }

    (chain, metrics)
}

/// Build an [`EventBus`] from config.
#[must_use]
pub fn build_bus(cfg: &Config) -> EventBus {
    let bus_config = to_bus_config(cfg);
    match to_middleware_chain(cfg) {
        (chain, Some(metrics)) => EventBus::with_chain_and_metrics(bus_config, chain, metrics),
        (chain, None) => EventBus::with_chain(bus_config, chain),
    }
}

/// Convert config to [`LogConfig`].
///
/// # Errors
///
/// Returns an error if `logging.format` is not a known format.
pub fn to_log_config(cfg: &Config) -> TelemetryResult<LogConfig> {
    LogConfig::try_from(&cfg.logging)
}
